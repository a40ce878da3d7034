use chrono::{DateTime, TimeZone, Utc};

use crate::broker::Record;

pub const HEADER_DEVICE_ID: &str = "device_id";
pub const HEADER_CONTENT_TYPE: &str = "content-type";
pub const HEADER_CREATION_TIME: &str = "creation-time";
pub const HEADER_QOS: &str = "qos";
pub const HEADER_TIME_TILL_DISCONNECT: &str = "ttd";

/// `ttd` value announcing that the device stays connected until further notice.
pub const TTD_UNLIMITED: i32 = -1;

/// Delivery guarantee the device asked for when publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

impl QoS {
    fn from_header(value: &str) -> Option<Self> {
        match value.trim() {
            "0" => Some(QoS::AtMostOnce),
            "1" => Some(QoS::AtLeastOnce),
            _ => None,
        }
    }
}

/// Where a message came from in the broker log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContext {
    record: Record,
}

impl MessageContext {
    pub fn topic(&self) -> &str {
        &self.record.topic
    }

    pub fn partition(&self) -> i32 {
        self.record.partition
    }

    pub fn offset(&self) -> i64 {
        self.record.offset
    }

    pub fn record(&self) -> &Record {
        &self.record
    }
}

/// A telemetry or event message published by a device, as seen by the
/// application's message handler.
#[derive(Debug, Clone, PartialEq)]
pub struct DownstreamMessage {
    tenant_id: String,
    device_id: Option<String>,
    content_type: Option<String>,
    creation_time: Option<DateTime<Utc>>,
    qos: Option<QoS>,
    time_till_disconnect: Option<i32>,
    context: MessageContext,
}

impl DownstreamMessage {
    /// Builds the handler's view of a record consumed from a tenant's topic.
    pub fn from_record(tenant_id: &str, record: Record) -> Self {
        // the device id is the record key, the header is kept for older producers
        let device_id = record
            .key
            .as_deref()
            .and_then(|k| std::str::from_utf8(k).ok())
            .filter(|k| !k.is_empty())
            .or_else(|| header_str(&record, HEADER_DEVICE_ID))
            .map(str::to_string);

        let content_type = header_str(&record, HEADER_CONTENT_TYPE).map(str::to_string);

        let creation_time = header_str(&record, HEADER_CREATION_TIME)
            .and_then(|v| v.trim().parse::<i64>().ok())
            .or(record.timestamp_ms)
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

        let qos = header_str(&record, HEADER_QOS).and_then(QoS::from_header);

        let time_till_disconnect = header_str(&record, HEADER_TIME_TILL_DISCONNECT)
            .and_then(|v| v.trim().parse::<i32>().ok());

        Self {
            tenant_id: tenant_id.to_string(),
            device_id,
            content_type,
            creation_time,
            qos,
            time_till_disconnect,
            context: MessageContext { record },
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn creation_time(&self) -> Option<DateTime<Utc>> {
        self.creation_time
    }

    pub fn qos(&self) -> Option<QoS> {
        self.qos
    }

    /// Seconds the device stays reachable for commands, [`TTD_UNLIMITED`] if it
    /// stays connected.
    pub fn time_till_disconnect(&self) -> Option<i32> {
        self.time_till_disconnect
    }

    /// True if the device announced it is ready to receive commands at `now`.
    pub fn is_device_connected(&self, now: DateTime<Utc>) -> bool {
        match (self.time_till_disconnect, self.creation_time) {
            (Some(TTD_UNLIMITED), _) => true,
            (Some(ttd), Some(created)) if ttd > 0 => created
                .checked_add_signed(chrono::Duration::seconds(i64::from(ttd)))
                .is_some_and(|until| now < until),
            _ => false,
        }
    }

    pub fn payload(&self) -> &[u8] {
        self.context.record.payload.as_deref().unwrap_or_default()
    }

    /// Payload as JSON, for handlers of `application/json` messages.
    pub fn payload_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(self.payload())
    }

    /// Value of an application property carried in a header.
    pub fn property(&self, name: &str) -> Option<&str> {
        header_str(&self.context.record, name)
    }

    pub fn context(&self) -> &MessageContext {
        &self.context
    }

    pub fn into_record(self) -> Record {
        self.context.record
    }
}

fn header_str<'a>(record: &'a Record, name: &str) -> Option<&'a str> {
    record
        .header(name)
        .and_then(|v| std::str::from_utf8(v).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn telemetry_record() -> Record {
        Record::new("hono.telemetry.tenant-a", 2, 42)
            .with_key("device-1")
            .with_payload(r#"{"temp": 21.5}"#)
            .with_header(HEADER_CONTENT_TYPE, "application/json")
            .with_header(HEADER_CREATION_TIME, "1700000000000")
            .with_header(HEADER_QOS, "1")
            .with_header("orig_adapter", "hono-mqtt")
            .with_timestamp_ms(1_700_000_999_000)
    }

    #[test]
    fn test_metadata_from_headers() {
        let msg = DownstreamMessage::from_record("tenant-a", telemetry_record());

        assert_eq!(msg.tenant_id(), "tenant-a");
        assert_eq!(msg.device_id(), Some("device-1"));
        assert_eq!(msg.content_type(), Some("application/json"));
        assert_eq!(msg.qos(), Some(QoS::AtLeastOnce));
        assert_eq!(
            msg.creation_time(),
            Utc.timestamp_millis_opt(1_700_000_000_000).single()
        );
        assert_eq!(msg.property("orig_adapter"), Some("hono-mqtt"));
        assert_eq!(msg.context().partition(), 2);
        assert_eq!(msg.context().offset(), 42);
    }

    #[test]
    fn test_json_payload() {
        #[derive(serde::Deserialize)]
        struct Reading {
            temp: f64,
        }

        let msg = DownstreamMessage::from_record("tenant-a", telemetry_record());
        let reading: Reading = msg.payload_json().unwrap();
        assert_eq!(reading.temp, 21.5);
    }

    #[test]
    fn test_device_id_falls_back_to_header() {
        let record = Record::new("hono.event.tenant-a", 0, 1).with_header(HEADER_DEVICE_ID, "device-2");
        let msg = DownstreamMessage::from_record("tenant-a", record);
        assert_eq!(msg.device_id(), Some("device-2"));
    }

    #[test]
    fn test_creation_time_falls_back_to_broker_timestamp() {
        let record = Record::new("hono.event.tenant-a", 0, 1).with_timestamp_ms(1_000);
        let msg = DownstreamMessage::from_record("tenant-a", record);
        assert_eq!(msg.creation_time(), Utc.timestamp_millis_opt(1_000).single());
    }

    #[test]
    fn test_missing_payload_is_empty() {
        let msg = DownstreamMessage::from_record("tenant-a", Record::new("t", 0, 0));
        assert!(msg.payload().is_empty());
        assert_eq!(msg.device_id(), None);
        assert_eq!(msg.qos(), None);
    }

    #[test]
    fn test_device_connected_by_ttd() {
        let created = Utc.timestamp_millis_opt(1_700_000_000_000).single().unwrap();
        let record = Record::new("t", 0, 0)
            .with_header(HEADER_CREATION_TIME, created.timestamp_millis().to_string())
            .with_header(HEADER_TIME_TILL_DISCONNECT, "30");
        let msg = DownstreamMessage::from_record("tenant-a", record);

        assert!(msg.is_device_connected(created + chrono::Duration::seconds(10)));
        assert!(!msg.is_device_connected(created + chrono::Duration::seconds(31)));

        let record = Record::new("t", 0, 0).with_header(HEADER_TIME_TILL_DISCONNECT, "-1");
        let msg = DownstreamMessage::from_record("tenant-a", record);
        assert!(msg.is_device_connected(created));
    }

    #[test]
    fn test_ttd_past_the_last_representable_time_is_not_connected() {
        let latest = DateTime::<Utc>::MAX_UTC;
        let record = Record::new("t", 0, 0)
            .with_header(HEADER_CREATION_TIME, latest.timestamp_millis().to_string())
            .with_header(HEADER_TIME_TILL_DISCONNECT, "60");
        let msg = DownstreamMessage::from_record("tenant-a", record);

        assert!(msg.creation_time().is_some());
        assert!(!msg.is_device_connected(Utc::now()));
    }
}
