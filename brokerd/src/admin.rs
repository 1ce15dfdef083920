//! Management commands aimed at the broker itself.
//!
//! A fixed set of commands is answered here; anything else is handed back
//! to the host framework's own command handler (`is_alive`, `num_clients`).
//! Most of the census commands are deliberate stubs: the broker no longer
//! tracks a server census, it only activates on demand.

use serde_json::json;

use crate::message::{Reply, Request, ResultCode};
use crate::reaper::Reaper;

pub struct AdminHandler {
    reaper: Reaper,
}

impl AdminHandler {
    pub fn new(reaper: Reaper) -> Self {
        Self { reaper }
    }

    /// Answer a recognized management command, or return `None` to defer to
    /// the framework handler.
    pub fn handle(&self, request: &Request) -> Option<Reply> {
        let command = request.command.as_deref()?;
        let reply = match command {
            "num_servers" => Reply::success(&request.msg_id).with_payload(json!({
                "num_servers": 0,
                "note": "server census is not tracked by the broker",
            })),
            "server_info" => Reply::success(&request.msg_id).with_payload(json!({
                "servers": [],
                "note": "server census is not tracked by the broker",
            })),
            "denied_services" => Reply::success(&request.msg_id).with_payload(json!({
                "denied": [],
                "note": "denial history is not tracked by the broker",
            })),
            "failure_info" => {
                let failures = self.reaper.recent_failures();
                Reply::success(&request.msg_id).with_payload(json!({
                    "num_failures": failures.len(),
                    "failures": failures,
                }))
            }
            // The broker runs indefinitely; remote shutdown is refused.
            "shutdown" => Reply::error(
                &request.msg_id,
                ResultCode::ServiceDenied,
                "remote shutdown of the broker is not permitted",
            ),
            _ => return None,
        };
        Some(reply)
    }
}
