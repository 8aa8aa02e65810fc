//! SUBSCRIBE and UNSUBSCRIBE handling

use std::time::Instant;

use tracing::debug;

use super::{reply, Broker};
use crate::protocol::{Direction, Outgoing, QoS, Subscribe, Unsubscribe, SUBACK_FAILURE};
use crate::session::InsertOutcome;
use crate::topic::validate_topic_filter;
use crate::transport::Transport;

impl Broker {
    /// Handle SUBSCRIBE: add each filter, queue matching retained messages
    /// and answer with SUBACK.
    pub(crate) fn handle_subscribe<T: Transport>(
        &mut self,
        client_id: &str,
        subscribe: Subscribe,
        transport: &mut T,
        now: Instant,
    ) {
        let Some(client) = self.sessions.get(client_id).map(|s| s.client_id.clone()) else {
            return;
        };

        let mut return_codes = Vec::with_capacity(subscribe.subscriptions.len());
        for sub in subscribe.subscriptions {
            if let Err(reason) = validate_topic_filter(&sub.filter) {
                debug!(
                    "Rejecting subscription of {} to '{}': {}",
                    client_id, sub.filter, reason
                );
                return_codes.push(SUBACK_FAILURE);
                continue;
            }
            debug!("{} {} {}", client_id, sub.qos as u8, sub.filter);
            self.subscriptions.add(&client, &sub.filter, sub.qos);
            self.retain_queue(client_id, &sub.filter, sub.qos, now);
            return_codes.push(sub.qos as u8);
        }

        reply(
            transport,
            client_id,
            Outgoing::SubAck {
                mid: subscribe.mid,
                return_codes,
            },
        );
    }

    /// Queue every retained message matching `filter` for one client
    fn retain_queue(&mut self, client_id: &str, filter: &str, sub_qos: QoS, now: Instant) {
        let retained = self.subscriptions.retained_matching(filter);
        let Some(session) = self.sessions.get_mut(client_id) else {
            return;
        };
        for id in retained {
            let Some(entry) = self.store.get(id) else {
                continue;
            };
            let qos = if self.config.upgrade_outgoing_qos {
                sub_qos
            } else {
                entry.message.qos.min(sub_qos)
            };
            let mid = if qos == QoS::AtMostOnce {
                0
            } else {
                session.next_mid()
            };
            let outcome = session.insert(
                &mut self.store,
                &self.config.limits,
                mid,
                Direction::Out,
                qos,
                true,
                id,
                now,
            );
            if outcome == InsertOutcome::Dropped {
                self.messages_dropped += 1;
            }
        }
    }

    /// Handle UNSUBSCRIBE: remove each filter and answer with UNSUBACK
    pub(crate) fn handle_unsubscribe<T: Transport>(
        &mut self,
        client_id: &str,
        unsubscribe: Unsubscribe,
        transport: &mut T,
    ) {
        for filter in &unsubscribe.filters {
            if !self.subscriptions.remove(client_id, filter) {
                debug!("{} was not subscribed to '{}'", client_id, filter);
            }
        }
        reply(transport, client_id, Outgoing::UnsubAck(unsubscribe.mid));
    }
}
