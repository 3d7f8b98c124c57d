use std::cmp::Ordering;
use std::fmt;

use crate::UpdateError;

/// A release tag as published by the registry, with its semver reading when
/// the tag carries one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    tag: String,
    semver: Option<semver::Version>,
}

impl Version {
    pub fn parse_tag(tag: &str) -> Result<Self, UpdateError> {
        let tag = tag.trim();
        if tag.is_empty() {
            return Err(UpdateError::Parse("release tag must not be empty".to_string()));
        }
        if tag.chars().any(char::is_whitespace) {
            return Err(UpdateError::Parse(format!(
                "release tag must not contain whitespace: '{tag}'"
            )));
        }

        Ok(Self {
            tag: tag.to_string(),
            semver: lenient_semver(tag),
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn semver(&self) -> Option<&semver::Version> {
        self.semver.as_ref()
    }

    /// Ordering between two tags. Identical tags are always `Equal`; tags
    /// without a semver reading on both sides are incomparable.
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        if self.tag == other.tag {
            return Some(Ordering::Equal);
        }
        match (&self.semver, &other.semver) {
            (Some(left), Some(right)) => Some(left.cmp_precedence(right)),
            _ => None,
        }
    }

    /// Incomparable tags count as newer whenever they differ.
    pub fn is_newer_than(&self, other: &Self) -> bool {
        match self.compare(other) {
            Some(ordering) => ordering == Ordering::Greater,
            None => self.tag != other.tag,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag)
    }
}

fn lenient_semver(tag: &str) -> Option<semver::Version> {
    let body = strip_tag_prefix(tag)?;
    let split_at = body.find(['-', '+']).unwrap_or(body.len());
    let (core, suffix) = body.split_at(split_at);

    let parts = core.split('.').collect::<Vec<_>>();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    let mut numbers = [0_u64; 3];
    for (slot, part) in numbers.iter_mut().zip(&parts) {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        *slot = part.parse().ok()?;
    }

    semver::Version::parse(&format!(
        "{}.{}.{}{}",
        numbers[0], numbers[1], numbers[2], suffix
    ))
    .ok()
}

fn strip_tag_prefix(tag: &str) -> Option<&str> {
    if tag.starts_with(|ch: char| ch.is_ascii_digit()) {
        return Some(tag);
    }

    let bytes = tag.as_bytes();
    let position = (0..bytes.len().saturating_sub(1))
        .rev()
        .find(|&idx| matches!(bytes[idx], b'v' | b'V') && bytes[idx + 1].is_ascii_digit())?;
    if position > 0 && bytes[position - 1].is_ascii_alphanumeric() {
        return None;
    }
    Some(&tag[position + 1..])
}
