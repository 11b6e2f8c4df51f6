// ABOUTME: Topic addressing shared by the delivery loop and the command router.
// ABOUTME: Templates carry one device-id placeholder and a trailing kind segment, e.g. device/{device_id}/events/{kind}.

use thiserror::Error;

pub const DEVICE_PLACEHOLDER: &str = "{device_id}";
pub const KIND_PLACEHOLDER: &str = "{kind}";

/// Errors raised while parsing or binding topic templates.
#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("topic template {0:?} must contain exactly one {{device_id}} placeholder")]
    DevicePlaceholder(String),

    #[error("topic template {0:?} must end with a /{{kind}} segment")]
    KindSegment(String),

    #[error("device id {0:?} is empty or contains MQTT wildcards")]
    InvalidDeviceId(String),

    #[error("topic kind {0:?} must be a single non-empty segment without wildcards")]
    InvalidKind(String),
}

fn is_valid_segment(s: &str) -> bool {
    !s.is_empty() && !s.contains(['/', '+', '#'])
}

/// A validated topic template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicTemplate {
    raw: String,
}

impl TopicTemplate {
    pub fn parse(template: &str) -> Result<Self, TopicError> {
        if template.matches(DEVICE_PLACEHOLDER).count() != 1 {
            return Err(TopicError::DevicePlaceholder(template.to_string()));
        }

        let kind_suffix = format!("/{KIND_PLACEHOLDER}");
        if !template.ends_with(&kind_suffix) || template.matches(KIND_PLACEHOLDER).count() != 1 {
            return Err(TopicError::KindSegment(template.to_string()));
        }

        Ok(Self {
            raw: template.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Substitute the device id, producing the root all topics of one device
    /// share.
    pub fn bind(&self, device_id: &str) -> Result<TopicRoot, TopicError> {
        if device_id.is_empty() || device_id.contains(['+', '#']) {
            return Err(TopicError::InvalidDeviceId(device_id.to_string()));
        }

        let base = self
            .raw
            .replace(DEVICE_PLACEHOLDER, device_id)
            .trim_end_matches(KIND_PLACEHOLDER)
            .to_string();

        Ok(TopicRoot { base })
    }
}

/// A template bound to a device id. Every topic under the root is the base
/// followed by a kind segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRoot {
    base: String,
}

impl TopicRoot {
    /// Full topic for a kind, e.g. `device/r1/events/read`.
    pub fn topic(&self, kind: &str) -> Result<String, TopicError> {
        if !is_valid_segment(kind) {
            return Err(TopicError::InvalidKind(kind.to_string()));
        }
        Ok(format!("{}{}", self.base, kind))
    }

    /// Subscription filter matching every single-segment child of a kind,
    /// e.g. `device/r1/manage/whitelist/+`.
    pub fn children_filter(&self, kind: &str) -> Result<String, TopicError> {
        Ok(format!("{}/+", self.topic(kind)?))
    }

    /// True if `topic` is exactly the topic for `kind`.
    pub fn matches(&self, topic: &str, kind: &str) -> bool {
        topic
            .strip_prefix(self.base.as_str())
            .is_some_and(|rest| rest == kind)
    }

    /// The trailing segment of `topic` when it sits directly below the topic
    /// for `kind`. Returns None for other topics or deeper nesting.
    pub fn trailing_segment<'t>(&self, topic: &'t str, kind: &str) -> Option<&'t str> {
        let rest = topic.strip_prefix(self.base.as_str())?;
        let segment = rest.strip_prefix(kind)?.strip_prefix('/')?;
        is_valid_segment(segment).then_some(segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manage_root() -> TopicRoot {
        TopicTemplate::parse("device/{device_id}/manage/{kind}")
            .unwrap()
            .bind("r1")
            .unwrap()
    }

    #[test]
    fn renders_topics_for_kinds() {
        let root = TopicTemplate::parse("events/{device_id}/{kind}")
            .unwrap()
            .bind("reader-7")
            .unwrap();
        assert_eq!(root.topic("read").unwrap(), "events/reader-7/read");
        assert_eq!(root.topic("offline").unwrap(), "events/reader-7/offline");
    }

    #[test]
    fn rejects_malformed_templates() {
        assert!(matches!(
            TopicTemplate::parse("device/manage/{kind}"),
            Err(TopicError::DevicePlaceholder(_))
        ));
        assert!(matches!(
            TopicTemplate::parse("{device_id}/{device_id}/{kind}"),
            Err(TopicError::DevicePlaceholder(_))
        ));
        assert!(matches!(
            TopicTemplate::parse("device/{device_id}/{kind}/tail"),
            Err(TopicError::KindSegment(_))
        ));
        assert!(matches!(
            TopicTemplate::parse("device/{device_id}{kind}"),
            Err(TopicError::KindSegment(_))
        ));
    }

    #[test]
    fn rejects_wildcard_device_ids_and_kinds() {
        let template = TopicTemplate::parse("device/{device_id}/manage/{kind}").unwrap();
        assert!(template.bind("").is_err());
        assert!(template.bind("r+1").is_err());
        assert!(manage_root().topic("a/b").is_err());
        assert!(manage_root().topic("#").is_err());
    }

    #[test]
    fn extracts_trailing_segment() {
        let root = manage_root();
        assert_eq!(
            root.trailing_segment("device/r1/manage/whitelist/add", "whitelist"),
            Some("add")
        );
        assert_eq!(
            root.trailing_segment("device/r1/manage/configure/max_queue_size", "configure"),
            Some("max_queue_size")
        );
    }

    #[test]
    fn trailing_segment_ignores_other_topics() {
        let root = manage_root();
        assert_eq!(root.trailing_segment("device/r1/manage/whitelist", "whitelist"), None);
        assert_eq!(root.trailing_segment("device/r1/manage/whitelist/", "whitelist"), None);
        assert_eq!(
            root.trailing_segment("device/r1/manage/whitelist/add/extra", "whitelist"),
            None
        );
        assert_eq!(root.trailing_segment("device/r2/manage/whitelist/add", "whitelist"), None);
        assert_eq!(root.trailing_segment("device/r1/manage/whitelists/add", "whitelist"), None);
    }

    #[test]
    fn exact_match_and_children_filter() {
        let root = manage_root();
        assert!(root.matches("device/r1/manage/reset", "reset"));
        assert!(!root.matches("device/r1/manage/reset/now", "reset"));
        assert_eq!(
            root.children_filter("configure").unwrap(),
            "device/r1/manage/configure/+"
        );
    }
}
