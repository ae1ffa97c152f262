//! Binary M2MP transport.

use crate::connection::Transport;
use crate::core::{Flow, Outbound, Payload, SessionCore};
use crate::error::ServerError;
use bytes::BytesMut;
use m2mp_protocol::control;
use m2mp_protocol::{Decoder, Encoder, Message, Role};
use tokio::time::Instant;

/// Server side of a binary connection.
pub struct M2mpTransport {
    encoder: Encoder,
}

impl M2mpTransport {
    pub fn new() -> Self {
        Self {
            encoder: Encoder::new(Role::Server),
        }
    }

    fn to_message(out: &Outbound) -> Option<Message> {
        Some(match out {
            Outbound::IdentResult(ok) => Message::IdentResponse { ok: *ok },
            Outbound::Ping(counter) => Message::PingRequest { counter: *counter },
            Outbound::Pong(counter) => Message::PingResponse { counter: *counter },
            Outbound::Settings(settings) => {
                control::settings_push(settings.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            }
            Outbound::RequestAllSettings => control::settings_request_all(),
            Outbound::Command { short_id, text } => control::command_push(*short_id, text),
            Outbound::RequestStatus(key) => control::status_request(key),
            Outbound::Data { channel, payload } => Message::data(channel.clone(), payload.clone()),
            Outbound::DataArray { channel, items } => Message::DataArray {
                channel: channel.clone(),
                items: items.clone(),
            },
            // no wire form
            Outbound::Line(_) | Outbound::Notice(_) => return None,
        })
    }
}

impl Default for M2mpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for M2mpTransport {
    type Decoder = Decoder;

    fn name(&self) -> &'static str {
        "m2mp"
    }

    fn decoder(&mut self) -> Decoder {
        Decoder::new(Role::Server)
    }

    fn handle(&mut self, core: &mut SessionCore, message: Message, now: Instant) -> Flow {
        let id = core.session.id;
        tracing::trace!("[{}] <- {}", id, message.kind());
        match message {
            Message::IdentRequest { ident } => {
                core.identify(&ident, now);
            }
            Message::PingRequest { counter } => core.push(Outbound::Pong(counter)),
            Message::PingResponse { counter } => {
                tracing::trace!("[{}] Pong {}", id, counter);
            }
            Message::DataSimple { channel, payload } => {
                core.route_data(&channel, Payload::Simple(payload))
            }
            Message::DataArray { channel, items } => {
                core.route_data(&channel, Payload::Array(items))
            }
            Message::Disconnected { cause } => {
                tracing::info!("[{}] Disconnected: {}", id, cause);
                return Flow::Close;
            }
            other => tracing::warn!("[{}] Unexpected {} from device", id, other.kind()),
        }
        Flow::Continue
    }

    fn encode(
        &mut self,
        core: &SessionCore,
        out: &Outbound,
        dst: &mut BytesMut,
    ) -> Result<(), ServerError> {
        match Self::to_message(out) {
            Some(message) => self.encoder.encode(&message, dst)?,
            None => {
                if let Outbound::Notice(notice) = out {
                    tracing::info!("[{}] {}", core.session.id, notice);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tests::{core, fixture};
    use m2mp_protocol::codec;

    fn wire(transport: &mut M2mpTransport, core: &mut SessionCore) -> Vec<Message> {
        let mut buf = BytesMut::new();
        for out in core.take_outbox() {
            transport.encode(core, &out, &mut buf).unwrap();
        }
        let (_, mut decoder) = codec::pair(Role::Client);
        decoder.extend(&buf);
        let mut messages = Vec::new();
        while let Some(m) = decoder.decode().unwrap() {
            messages.push(m);
        }
        messages
    }

    #[tokio::test]
    async fn test_identification_sequence_on_the_wire() {
        let fx = fixture();
        let now = Instant::now();
        let mut core = core(&fx, now);
        let mut transport = M2mpTransport::new();

        let flow = transport.handle(
            &mut core,
            Message::IdentRequest {
                ident: "acme:device001".to_string(),
            },
            now,
        );
        assert_eq!(flow, Flow::Continue);

        let messages = wire(&mut transport, &mut core);
        assert_eq!(messages[0], Message::IdentResponse { ok: true });
        assert_eq!(messages[1], Message::array("_set", ["ga"]));
        assert_eq!(messages[2], Message::array("_sta", ["g", "cap"]));
        assert_eq!(messages.len(), 3);
    }

    #[tokio::test]
    async fn test_ping_answered_with_same_counter() {
        let fx = fixture();
        let now = Instant::now();
        let mut core = core(&fx, now);
        let mut transport = M2mpTransport::new();

        transport.handle(&mut core, Message::PingRequest { counter: 42 }, now);
        assert_eq!(
            wire(&mut transport, &mut core),
            vec![Message::PingResponse { counter: 42 }]
        );
    }

    #[tokio::test]
    async fn test_notice_has_no_wire_form() {
        let fx = fixture();
        let now = Instant::now();
        let mut core = core(&fx, now);
        let mut transport = M2mpTransport::new();

        assert_eq!(core.check_identified(), Flow::Close);
        assert!(wire(&mut transport, &mut core).is_empty());
    }
}
