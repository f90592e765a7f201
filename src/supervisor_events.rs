use serde::Serialize;

use crate::supervisor_state::SupervisorState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SupervisorEvent {
    StateChanged {
        state: SupervisorState,
    },
    PortDiscovered {
        port: u16,
    },
    /// `unexpected` is set when the backend died on its own after becoming ready.
    BackendExited {
        code: Option<i32>,
        unexpected: bool,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorSnapshot {
    pub state: SupervisorState,
    pub base_url: Option<String>,
    pub pid: Option<u32>,
    pub port: Option<u16>,
}

impl SupervisorSnapshot {
    /// The base URL, but only once the backend has passed its health check.
    pub fn ready_base_url(&self) -> Option<&str> {
        if self.state == SupervisorState::Ready {
            self.base_url.as_deref()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snapshot_hides_base_url_outside_ready() {
        let mut snapshot = SupervisorSnapshot {
            state: SupervisorState::Starting,
            base_url: Some("http://127.0.0.1:54321".to_string()),
            pid: Some(42),
            port: Some(54321),
        };
        assert_eq!(snapshot.ready_base_url(), None);

        snapshot.state = SupervisorState::Ready;
        assert_eq!(snapshot.ready_base_url(), Some("http://127.0.0.1:54321"));
    }

    #[test]
    fn events_serialize_with_kind_tag() {
        let value = serde_json::to_value(SupervisorEvent::BackendExited {
            code: Some(3),
            unexpected: true,
        })
        .expect("serialize event");
        assert_eq!(
            value,
            json!({ "kind": "backendExited", "code": 3, "unexpected": true })
        );

        let snapshot = serde_json::to_value(SupervisorSnapshot::default()).expect("serialize");
        assert_eq!(snapshot["state"], json!("idle"));
        assert_eq!(snapshot["baseUrl"], json!(null));
    }
}
