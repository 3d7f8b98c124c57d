use std::time::Duration;

use relaunch_core::{UpdateError, Version};

use super::*;

#[test]
fn parse_latest_release_reads_tag_name() {
    let body = r#"{"tag_name":"v1.2.0","name":"1.2.0","draft":false,"prerelease":false,"assets":[]}"#;
    let version = parse_latest_release(body).expect("must parse release");
    assert_eq!(version.tag(), "v1.2.0");
}

#[test]
fn parse_latest_release_rejects_malformed_json() {
    let err = parse_latest_release("<html>rate limited</html>").expect_err("must reject body");
    assert!(matches!(err, UpdateError::Parse(_)));
}

#[test]
fn parse_latest_release_rejects_missing_or_empty_tag() {
    let err = parse_latest_release(r#"{"name":"1.2.0"}"#).expect_err("must require tag");
    assert!(err.to_string().contains("missing tag_name"));

    let err = parse_latest_release(r#"{"tag_name":""}"#).expect_err("must reject empty tag");
    assert!(matches!(err, UpdateError::Parse(_)));
}

#[test]
fn parse_latest_release_rejects_prerelease() {
    let err = parse_latest_release(r#"{"tag_name":"v2.0.0-rc.1","prerelease":true}"#)
        .expect_err("must reject prerelease");
    assert!(matches!(err, UpdateError::Parse(_)));
}

#[test]
fn latest_release_url_trims_trailing_slash() {
    let source = GithubReleases::new("https://api.github.com/", "nymtech/nym", Duration::from_secs(5))
        .expect("must build client");
    assert_eq!(
        source.latest_release_url(),
        "https://api.github.com/repos/nymtech/nym/releases/latest"
    );
}

#[test]
fn unreachable_registry_is_a_network_error() {
    let source = GithubReleases::new("http://127.0.0.1:9", "nymtech/nym", Duration::from_secs(2))
        .expect("must build client");
    let err = source.fetch_latest().expect_err("nothing listens on the discard port");
    assert!(matches!(err, UpdateError::Network(_)));
}

#[test]
fn expand_asset_template_fills_placeholders() {
    let version = Version::parse_tag("nym-binaries-v2025.13-emmental").expect("must parse");
    let url = expand_asset_template(
        "https://github.com/{repo}/releases/download/{tag}/{asset}",
        "nymtech/nym",
        &version,
        "nym-node",
    );
    assert_eq!(
        url,
        "https://github.com/nymtech/nym/releases/download/nym-binaries-v2025.13-emmental/nym-node"
    );
}
