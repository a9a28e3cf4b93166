//! [`DestinationResolver`] – where a message for a given robot goes.
//!
//! | Transport | Destination |
//! |---|---|
//! | [`TransportKind::Queue`] | `{root}/{manufacturer}/{deviceId}/{messageKind}` |
//! | [`TransportKind::Http`] | expanded HTTP template + `/{messageKind}` |
//! | [`TransportKind::Stream`] | expanded WebSocket template |
//!
//! Templates may contain the placeholders `{deviceId}` and `{manufacturer}`.

use fleetlink_types::{MessageKind, TransportKind};

pub const DEFAULT_ROOT_NAMESPACE: &str = "uagv/v2";
pub const DEFAULT_HTTP_URL_TEMPLATE: &str = "http://{deviceId}:8080/vda5050";
pub const DEFAULT_STREAM_URL_TEMPLATE: &str = "ws://{deviceId}:8081/vda5050";

#[derive(Debug, Clone)]
pub struct DestinationResolver {
    root_namespace: String,
    http_url_template: String,
    stream_url_template: String,
}

impl DestinationResolver {
    pub fn new(
        root_namespace: impl Into<String>,
        http_url_template: impl Into<String>,
        stream_url_template: impl Into<String>,
    ) -> Self {
        Self {
            root_namespace: root_namespace.into().trim_end_matches('/').to_string(),
            http_url_template: http_url_template.into(),
            stream_url_template: stream_url_template.into(),
        }
    }

    pub fn root_namespace(&self) -> &str {
        &self.root_namespace
    }

    /// Compute the transport-specific destination for a message.
    pub fn resolve(
        &self,
        device_id: &str,
        manufacturer: &str,
        kind: MessageKind,
        transport: TransportKind,
    ) -> String {
        match transport {
            TransportKind::Queue => self.topic(manufacturer, device_id, kind),
            TransportKind::Http => {
                let base = expand(&self.http_url_template, device_id, manufacturer);
                format!("{}/{}", base.trim_end_matches('/'), kind.as_str())
            }
            TransportKind::Stream => expand(&self.stream_url_template, device_id, manufacturer),
        }
    }

    /// Queue topic for one robot and message kind.
    pub fn topic(&self, manufacturer: &str, device_id: &str, kind: MessageKind) -> String {
        format!(
            "{}/{}/{}/{}",
            self.root_namespace,
            manufacturer,
            device_id,
            kind.as_str()
        )
    }

    /// Wildcard subscription covering `kind` for every robot.
    pub fn wildcard_topic(&self, kind: MessageKind) -> String {
        format!("{}/+/+/{}", self.root_namespace, kind.as_str())
    }

    /// Split an inbound topic into `(manufacturer, device_id, kind)`.
    ///
    /// Returns `None` for topics outside the root namespace, with the wrong
    /// depth, or with an unknown message kind.
    pub fn parse_topic<'a>(&self, topic: &'a str) -> Option<(&'a str, &'a str, MessageKind)> {
        let rest = topic.strip_prefix(self.root_namespace.as_str())?;
        let rest = rest.strip_prefix('/')?;
        let mut parts = rest.split('/');
        let manufacturer = parts.next()?;
        let device_id = parts.next()?;
        let kind = MessageKind::from_topic_segment(parts.next()?)?;
        if parts.next().is_some() || manufacturer.is_empty() || device_id.is_empty() {
            return None;
        }
        Some((manufacturer, device_id, kind))
    }
}

impl Default for DestinationResolver {
    fn default() -> Self {
        Self::new(
            DEFAULT_ROOT_NAMESPACE,
            DEFAULT_HTTP_URL_TEMPLATE,
            DEFAULT_STREAM_URL_TEMPLATE,
        )
    }
}

fn expand(template: &str, device_id: &str, manufacturer: &str) -> String {
    template
        .replace("{deviceId}", device_id)
        .replace("{manufacturer}", manufacturer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_destination_is_namespaced_topic() {
        let resolver = DestinationResolver::default();
        assert_eq!(
            resolver.resolve("agv-01", "acme", MessageKind::Order, TransportKind::Queue),
            "uagv/v2/acme/agv-01/order"
        );
        assert_eq!(
            resolver.resolve("agv-01", "acme", MessageKind::InstantActions, TransportKind::Queue),
            "uagv/v2/acme/agv-01/instantActions"
        );
    }

    #[test]
    fn http_destination_appends_message_kind() {
        let resolver = DestinationResolver::new(
            "uagv/v2/",
            "https://fleet.local/{manufacturer}/{deviceId}/",
            DEFAULT_STREAM_URL_TEMPLATE,
        );
        assert_eq!(
            resolver.resolve("agv-01", "acme", MessageKind::Order, TransportKind::Http),
            "https://fleet.local/acme/agv-01/order"
        );
        assert_eq!(resolver.root_namespace(), "uagv/v2");
    }

    #[test]
    fn stream_destination_is_per_device_socket() {
        let resolver = DestinationResolver::default();
        assert_eq!(
            resolver.resolve("agv-07", "acme", MessageKind::Order, TransportKind::Stream),
            "ws://agv-07:8081/vda5050"
        );
    }

    #[test]
    fn parse_topic_extracts_identity_and_kind() {
        let resolver = DestinationResolver::default();
        assert_eq!(
            resolver.parse_topic("uagv/v2/acme/agv-01/state"),
            Some(("acme", "agv-01", MessageKind::State))
        );
        assert_eq!(resolver.parse_topic("other/acme/agv-01/state"), None);
        assert_eq!(resolver.parse_topic("uagv/v2/acme/agv-01/state/extra"), None);
        assert_eq!(resolver.parse_topic("uagv/v2/acme/agv-01/unknown"), None);
        assert_eq!(resolver.parse_topic("uagv/v2/acme/agv-01"), None);
    }

    #[test]
    fn wildcard_topic_covers_all_devices() {
        let resolver = DestinationResolver::default();
        assert_eq!(
            resolver.wildcard_topic(MessageKind::Connection),
            "uagv/v2/+/+/connection"
        );
    }
}
