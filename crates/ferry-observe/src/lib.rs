use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    RequestHeaders,
    ResponseHeaders,
    UpstreamConnected,
    UpstreamReused,
    ConnectTunnelEstablished,
    StreamClosed,
}

/// Identity of one proxied client connection plus its current destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowContext {
    pub flow_id: u64,
    pub client_addr: String,
    pub server_host: String,
    pub server_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventType,
    pub context: FlowContext,
    pub occurred_at_unix_ms: u128,
    pub attributes: BTreeMap<String, String>,
}

impl Event {
    pub fn new(kind: EventType, context: FlowContext) -> Self {
        Self {
            kind,
            context,
            occurred_at_unix_ms: now_unix_ms(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}

/// Injected at server construction; handlers never log through a global.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

#[derive(Debug, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: Event) {}
}

/// Collects events in memory; the test sink.
#[derive(Debug, Default, Clone)]
pub struct VecEventSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl VecEventSink {
    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().expect("lock poisoned").clone()
    }
}

impl EventSink for VecEventSink {
    fn emit(&self, event: Event) {
        self.events.lock().expect("lock poisoned").push(event);
    }
}

fn now_unix_ms() -> u128 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis(),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::{Event, EventSink, EventType, FlowContext, VecEventSink};

    fn context() -> FlowContext {
        FlowContext {
            flow_id: 7,
            client_addr: "127.0.0.1:50000".to_string(),
            server_host: "example.com".to_string(),
            server_port: 80,
        }
    }

    #[test]
    fn vec_sink_records_events_in_order() {
        let sink = VecEventSink::default();
        sink.emit(Event::new(EventType::RequestHeaders, context()));
        sink.emit(
            Event::new(EventType::StreamClosed, context())
                .with_attribute("reason_code", "relay_eof"),
        );

        let events = sink.snapshot();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventType::RequestHeaders);
        assert_eq!(
            events[1].attributes.get("reason_code").map(String::as_str),
            Some("relay_eof")
        );
    }
}
