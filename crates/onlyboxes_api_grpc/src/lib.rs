//! Generated gRPC contract for the Onlyboxes worker link.
//!
//! The `.proto` under `proto/` is the source of truth; this crate only
//! re-exports the tonic-generated module and adds frame constructors so
//! callers never build `oneof` wrappers by hand.

pub mod proto {
    pub mod onlyboxes {
        pub mod worker {
            pub mod v1 {
                tonic::include_proto!("onlyboxes.worker.v1");
            }
        }
    }
}

pub use proto::onlyboxes::worker::v1 as worker_v1;

use worker_v1::{
    console_frame, worker_frame, CommandDispatch, CommandResult, ConnectAck, ConsoleFrame,
    Heartbeat, HeartbeatAck, Hello, WorkerFrame,
};

impl ConsoleFrame {
    pub fn connect_ack(session_id: impl Into<String>, heartbeat_interval_sec: u32) -> Self {
        ConsoleFrame {
            frame: Some(console_frame::Frame::ConnectAck(ConnectAck {
                session_id: session_id.into(),
                heartbeat_interval_sec,
            })),
        }
    }

    pub fn heartbeat_ack(now_ms: i64) -> Self {
        ConsoleFrame {
            frame: Some(console_frame::Frame::HeartbeatAck(HeartbeatAck { now_ms })),
        }
    }

    pub fn command_dispatch(dispatch: CommandDispatch) -> Self {
        ConsoleFrame {
            frame: Some(console_frame::Frame::CommandDispatch(dispatch)),
        }
    }
}

impl WorkerFrame {
    pub fn hello(hello: Hello) -> Self {
        WorkerFrame {
            frame: Some(worker_frame::Frame::Hello(hello)),
        }
    }

    pub fn heartbeat(heartbeat: Heartbeat) -> Self {
        WorkerFrame {
            frame: Some(worker_frame::Frame::Heartbeat(heartbeat)),
        }
    }

    pub fn command_result(result: CommandResult) -> Self {
        WorkerFrame {
            frame: Some(worker_frame::Frame::CommandResult(result)),
        }
    }
}
