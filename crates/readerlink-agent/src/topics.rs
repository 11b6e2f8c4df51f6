// ABOUTME: Resolves every concrete topic one device uses from its settings, once at startup.
// ABOUTME: Shared by the supervisor (subscriptions, presence), delivery loop (read topic) and router (dispatch table).

use readerlink_core::{Settings, TopicError, TopicRoot, TopicTemplate};

/// The topics of one device, bound to its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopics {
    pub manage_root: TopicRoot,
    pub read: String,
    pub error: String,
    pub online: String,
    pub offline: String,
    pub whitelist_kind: String,
    pub config_kind: String,
    pub reset_kind: String,
    /// Filters subscribed on every session: whitelist children, config
    /// children and the exact reset topic.
    pub subscriptions: Vec<String>,
}

impl DeviceTopics {
    pub fn from_settings(settings: &Settings) -> Result<Self, TopicError> {
        let device_id = settings.device_id();
        let publish_root = TopicTemplate::parse(settings.publish_topic_template())?.bind(device_id)?;
        let manage_root =
            TopicTemplate::parse(settings.subscribe_topic_template())?.bind(device_id)?;

        let whitelist_kind = settings.manage_whitelist().to_string();
        let config_kind = settings.manage_config().to_string();
        let reset_kind = settings.manage_reset().to_string();

        let subscriptions = vec![
            manage_root.children_filter(&whitelist_kind)?,
            manage_root.children_filter(&config_kind)?,
            manage_root.topic(&reset_kind)?,
        ];

        Ok(Self {
            read: publish_root.topic(settings.read_event())?,
            error: publish_root.topic(settings.error_event())?,
            online: publish_root.topic(settings.online_event())?,
            offline: publish_root.topic(settings.offline_event())?,
            manage_root,
            whitelist_kind,
            config_kind,
            reset_kind,
            subscriptions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use readerlink_core::settings::keys;

    fn settings_for(device_id: &str) -> Settings {
        let mut settings = Settings::defaults();
        settings.set(keys::DEVICE_ID, device_id.into());
        settings
    }

    #[test]
    fn resolves_default_layout() {
        let topics = DeviceTopics::from_settings(&settings_for("r1")).unwrap();

        assert_eq!(topics.read, "device/r1/events/read");
        assert_eq!(topics.error, "device/r1/events/error");
        assert_eq!(topics.online, "device/r1/events/online");
        assert_eq!(topics.offline, "device/r1/events/offline");
        assert_eq!(
            topics.subscriptions,
            vec![
                "device/r1/manage/whitelist/+".to_string(),
                "device/r1/manage/configure/+".to_string(),
                "device/r1/manage/reset".to_string(),
            ]
        );
    }

    #[test]
    fn follows_custom_templates() {
        let mut settings = settings_for("gate-2");
        settings.set(keys::PUBLISH_TOPIC_TEMPLATE, "site/a/{device_id}/{kind}".into());
        settings.set(keys::READ_EVENT, "scan".into());

        let topics = DeviceTopics::from_settings(&settings).unwrap();
        assert_eq!(topics.read, "site/a/gate-2/scan");
    }

    #[test]
    fn rejects_wildcard_device_id() {
        assert!(matches!(
            DeviceTopics::from_settings(&settings_for("r#")),
            Err(TopicError::InvalidDeviceId(_))
        ));
    }
}
