//! PUBLISH handling

use std::time::Instant;

use tracing::{debug, trace};

use super::{reply, Broker, Result};
use crate::protocol::{Direction, Outgoing, Publish, QoS};
use crate::session::InsertOutcome;
use crate::topic::validate_topic_name;
use crate::transport::Transport;

impl Broker {
    /// Handle PUBLISH from a client
    pub(crate) fn handle_publish<T: Transport>(
        &mut self,
        client_id: &str,
        publish: Publish,
        transport: &mut T,
        now: Instant,
    ) -> Result<()> {
        if let Err(reason) = validate_topic_name(&publish.topic) {
            debug!(
                "Dropping PUBLISH from {} on invalid topic '{}': {}",
                client_id, publish.topic, reason
            );
            self.publishes_rejected += 1;
            return Ok(());
        }

        trace!(
            "Received PUBLISH from {} (d{}, q{}, r{}, m{}, '{}', ... ({} bytes))",
            client_id,
            u8::from(publish.dup),
            publish.qos as u8,
            u8::from(publish.retain),
            publish.mid,
            publish.topic,
            publish.payload.len()
        );

        let limit = self.config.message_size_limit;
        if limit > 0 && publish.payload.len() > limit {
            debug!(
                "Dropped too large PUBLISH from {} (q{}, m{}, '{}')",
                client_id, publish.qos as u8, publish.mid, publish.topic
            );
            self.publishes_rejected += 1;
            match publish.qos {
                QoS::AtMostOnce => {}
                QoS::AtLeastOnce => reply(transport, client_id, Outgoing::PubAck(publish.mid)),
                QoS::ExactlyOnce => reply(transport, client_id, Outgoing::PubRec(publish.mid)),
            }
            return Ok(());
        }

        match publish.qos {
            QoS::AtMostOnce => self.publish_message(
                client_id,
                publish.mid,
                &publish.topic,
                publish.payload,
                publish.qos,
                publish.retain,
                now,
            ),
            QoS::AtLeastOnce => {
                let mid = publish.mid;
                self.publish_message(
                    client_id,
                    mid,
                    &publish.topic,
                    publish.payload,
                    publish.qos,
                    publish.retain,
                    now,
                )?;
                reply(transport, client_id, Outgoing::PubAck(mid));
                Ok(())
            }
            QoS::ExactlyOnce => self.receive_qos2(client_id, publish, transport, now),
        }
    }

    /// First half of an inbound QoS 2 exchange: hold the message until PUBREL.
    ///
    /// The PUBREC itself goes out on the write pass; a resent PUBLISH for a
    /// mid that is already held gets its PUBREC again without a new entry.
    fn receive_qos2<T: Transport>(
        &mut self,
        client_id: &str,
        publish: Publish,
        transport: &mut T,
        now: Instant,
    ) -> Result<()> {
        let mid = publish.mid;
        let Some(session) = self.sessions.get_mut(client_id) else {
            return Ok(());
        };
        if session.has_inbound(mid) {
            debug!("Duplicate QoS 2 PUBLISH from {} (m{})", client_id, mid);
            reply(transport, client_id, Outgoing::PubRec(mid));
            return Ok(());
        }

        let id = self.store.store(
            client_id,
            mid,
            &publish.topic,
            publish.payload,
            publish.qos,
            publish.retain,
        )?;
        self.store.acquire(id);
        let outcome = session.insert(
            &mut self.store,
            &self.config.limits,
            mid,
            Direction::In,
            QoS::ExactlyOnce,
            publish.retain,
            id,
            now,
        );
        self.store.release(id);

        match outcome {
            InsertOutcome::Queued => self.changes += 1,
            InsertOutcome::Dropped => self.messages_dropped += 1,
            _ => {}
        }
        Ok(())
    }
}
