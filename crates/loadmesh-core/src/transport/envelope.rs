use serde::{Deserialize, Serialize};

use crate::model::{SlaveExecutionState, SlaveInfo, SlaveStatus};
use crate::buffer::{BufferedMetrics, BufferedResult};

/// Wire message wrapper shared by both transport modes (persistent socket
/// and HTTP long-poll). `type` discriminates the payload shape the same way
/// a websocket frame header does.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Envelope {
    Register(SlaveInfo),
    #[serde(rename = "register_ack")]
    RegisterAck { slave_id: String },
    Heartbeat(SlaveStatus),
    HeartbeatAck,
    /// Application-level liveness probe, answered with `Pong`. Distinct
    /// from the WS-level ping/pong frames `SocketTransport` already
    /// exchanges — this one round-trips through `handle_envelope` so a
    /// poll-transport slave (no WS frames at all) can be probed the same
    /// way.
    Ping,
    Pong,
    TaskAssign(crate::model::Task),
    TaskAck { task_id: String },
    ResultBatch {
        results: Vec<BufferedResult>,
        metrics: Vec<BufferedMetrics>,
    },
    Progress {
        execution_id: String,
        slave_id: String,
        state: SlaveExecutionState,
    },
    Command(Command),
    CommandAck { command_id: String },
    Error { code: String, message: String },
}

/// Control-plane instruction pushed from master to slave mid-execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    Pause { execution_id: String, command_id: String },
    Resume { execution_id: String, command_id: String },
    Abort { execution_id: String, command_id: String },
    Scale { execution_id: String, command_id: String, target_vus: u32 },
    Drain { command_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_ack_serializes_with_no_data_field_value() {
        let envelope = Envelope::HeartbeatAck;
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "heartbeat_ack");
    }

    #[test]
    fn command_roundtrips_through_envelope() {
        let envelope = Envelope::Command(Command::Pause {
            execution_id: "e1".to_string(),
            command_id: "c1".to_string(),
        });
        let json = serde_json::to_string(&envelope).unwrap();
        let parsed: Envelope = serde_json::from_str(&json).unwrap();
        match parsed {
            Envelope::Command(Command::Pause { execution_id, .. }) => {
                assert_eq!(execution_id, "e1");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn progress_envelope_roundtrips_slave_execution_state() {
        use crate::model::Segment;

        let envelope = Envelope::Progress {
            execution_id: "e1".to_string(),
            slave_id: "s1".to_string(),
            state: SlaveExecutionState::new(Segment::full()),
        };
        let json = serde_json::to_string(&envelope).unwrap();
        let parsed: Envelope = serde_json::from_str(&json).unwrap();
        match parsed {
            Envelope::Progress { execution_id, slave_id, .. } => {
                assert_eq!(execution_id, "e1");
                assert_eq!(slave_id, "s1");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn scale_command_carries_target_vus() {
        let envelope = Envelope::Command(Command::Scale {
            execution_id: "e1".to_string(),
            command_id: "c1".to_string(),
            target_vus: 25,
        });
        let json = serde_json::to_string(&envelope).unwrap();
        let parsed: Envelope = serde_json::from_str(&json).unwrap();
        match parsed {
            Envelope::Command(Command::Scale { target_vus, .. }) => assert_eq!(target_vus, 25),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn register_ack_serializes_with_register_ack_tag() {
        let envelope = Envelope::RegisterAck { slave_id: "s1".to_string() };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "register_ack");
        assert_eq!(json["data"]["slave_id"], "s1");
    }

    #[test]
    fn ping_pong_roundtrip() {
        let json = serde_json::to_string(&Envelope::Ping).unwrap();
        assert!(matches!(serde_json::from_str::<Envelope>(&json).unwrap(), Envelope::Ping));
        let json = serde_json::to_string(&Envelope::Pong).unwrap();
        assert!(matches!(serde_json::from_str::<Envelope>(&json).unwrap(), Envelope::Pong));
    }

    #[test]
    fn error_envelope_carries_code_and_message() {
        let envelope = Envelope::Error {
            code: "not-found".to_string(),
            message: "slave missing".to_string(),
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["data"]["code"], "not-found");
    }
}
