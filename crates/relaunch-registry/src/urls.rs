use relaunch_core::Version;

/// Fills `{repo}`, `{tag}` and `{asset}` placeholders.
pub fn expand_asset_template(template: &str, repo: &str, version: &Version, asset: &str) -> String {
    template
        .replace("{repo}", repo)
        .replace("{tag}", version.tag())
        .replace("{asset}", asset)
}
