use serde::{Deserialize, Serialize};

/// Events the client sends over the WebSocket. Every event names its tab;
/// all of a user's tabs share one connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    PtyInput {
        #[serde(rename = "tabId")]
        tab_id: String,
        input: String,
    },
    Resize {
        #[serde(rename = "tabId")]
        tab_id: String,
        cols: u16,
        rows: u16,
    },
    TabOpen {
        #[serde(rename = "tabId")]
        tab_id: String,
    },
    TabClose {
        #[serde(rename = "tabId")]
        tab_id: String,
    },
    TabSelect {
        #[serde(rename = "tabId")]
        tab_id: String,
    },
}

/// Events the server pushes to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    PtyOutput {
        #[serde(rename = "tabId")]
        tab_id: String,
        output: String,
    },
    /// Topology snapshot sent once on bind so the UI can reconcile
    Tabs {
        tabs: Vec<String>,
        active_tab: Option<String>,
    },
    TabExit {
        #[serde(rename = "tabId")]
        tab_id: String,
        code: u32,
    },
    /// Tab-scoped failure; the connection and other tabs are unaffected
    TabError {
        #[serde(rename = "tabId")]
        tab_id: String,
        message: String,
    },
    /// Connection-fatal error (auth), after which the server closes the socket
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_event_wire_names() {
        let ev: ClientEvent =
            serde_json::from_str(r#"{"type":"pty-input","tabId":"1","input":"ls\n"}"#).unwrap();
        assert!(matches!(ev, ClientEvent::PtyInput { ref tab_id, ref input }
            if tab_id == "1" && input == "ls\n"));

        let ev: ClientEvent =
            serde_json::from_str(r#"{"type":"resize","tabId":"2","cols":100,"rows":40}"#).unwrap();
        assert!(matches!(ev, ClientEvent::Resize { cols: 100, rows: 40, .. }));
    }

    #[test]
    fn test_malformed_events_rejected() {
        // Missing tabId
        assert!(serde_json::from_str::<ClientEvent>(r#"{"type":"pty-input","input":"x"}"#).is_err());
        // Unknown type
        assert!(serde_json::from_str::<ClientEvent>(r#"{"type":"format-disk"}"#).is_err());
        // Not JSON
        assert!(serde_json::from_str::<ClientEvent>("garbage").is_err());
    }

    #[test]
    fn test_server_event_wire_shape() {
        let json = serde_json::to_string(&ServerEvent::PtyOutput {
            tab_id: "1".into(),
            output: "hi\n".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"pty-output","tabId":"1","output":"hi\n"}"#);

        let json = serde_json::to_string(&ServerEvent::Error {
            message: "Unauthorized".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"error","message":"Unauthorized"}"#);
    }
}
