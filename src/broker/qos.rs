//! QoS acknowledgment handling (PUBACK, PUBREC, PUBREL, PUBCOMP)

use std::time::Instant;

use tracing::{debug, trace, warn};

use super::{reply, Broker};
use crate::protocol::Outgoing;
use crate::session::{Ack, AckOutcome};
use crate::transport::Transport;

impl Broker {
    /// Handle PUBACK: the outbound QoS 1 delivery is complete
    pub(crate) fn handle_puback(&mut self, client_id: &str, mid: u16, now: Instant) {
        trace!("Received PUBACK from {} (Mid: {})", client_id, mid);
        self.acknowledge(client_id, mid, Ack::PubAck, now);
    }

    /// Handle PUBREC: the write pass sends PUBREL next
    pub(crate) fn handle_pubrec(&mut self, client_id: &str, mid: u16, now: Instant) {
        trace!("Received PUBREC from {} (Mid: {})", client_id, mid);
        self.acknowledge(client_id, mid, Ack::PubRec, now);
    }

    /// Handle PUBCOMP: the outbound QoS 2 delivery is complete
    pub(crate) fn handle_pubcomp(&mut self, client_id: &str, mid: u16, now: Instant) {
        trace!("Received PUBCOMP from {} (Mid: {})", client_id, mid);
        self.acknowledge(client_id, mid, Ack::PubComp, now);
    }

    fn acknowledge(&mut self, client_id: &str, mid: u16, ack: Ack, now: Instant) {
        let Some(session) = self.sessions.get_mut(client_id) else {
            return;
        };
        match session.acknowledge(&mut self.store, &self.config.limits, mid, ack, now) {
            AckOutcome::Applied => {}
            AckOutcome::Unknown => {
                debug!("{:?} from {} for unknown mid {}", ack, client_id, mid);
            }
            AckOutcome::Unexpected(state) => {
                warn!(
                    "Protocol violation: {:?} from {} for mid {} in state {}",
                    ack, client_id, mid, state
                );
            }
        }
    }

    /// Handle PUBREL: forward the held message and answer with PUBCOMP.
    ///
    /// PUBCOMP is sent even when nothing is held for `mid`, so a client whose
    /// PUBCOMP was lost can finish its exchange.
    pub(crate) fn handle_pubrel<T: Transport>(
        &mut self,
        client_id: &str,
        mid: u16,
        transport: &mut T,
        now: Instant,
    ) {
        trace!("Received PUBREL from {} (Mid: {})", client_id, mid);
        let released = self
            .sessions
            .get_mut(client_id)
            .and_then(|s| s.release(&self.config.limits, mid, now));

        match released {
            Some((id, retain)) => {
                self.messages_queue(id, retain, now);
                self.store.release(id);
            }
            None => debug!("PUBREL from {} for unknown mid {}", client_id, mid),
        }
        reply(transport, client_id, Outgoing::PubComp(mid));
    }
}
