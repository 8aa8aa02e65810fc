//! CONNECT and DISCONNECT handling

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use super::{unix_time, Broker, Result};
use crate::protocol::Connect;
use crate::session::ClientSession;
use crate::topic::validate_topic_name;

impl Broker {
    /// Handle CONNECT: create, resume or take over a session
    pub(crate) fn handle_connect(&mut self, client_id: &str, connect: Connect, now: Instant) {
        let resumed = match self.sessions.get_mut(client_id) {
            Some(session) => {
                if session.is_connected() {
                    info!(
                        "Client {} already connected, closing old connection.",
                        client_id
                    );
                }
                if connect.clean_session || session.clean_session() {
                    session.clear(&mut self.store);
                    self.subscriptions.remove_client(client_id);
                    false
                } else {
                    true
                }
            }
            None => {
                let client: Arc<str> = Arc::from(client_id);
                self.sessions.insert(
                    client.clone(),
                    ClientSession::new(client, connect.clean_session),
                );
                false
            }
        };

        let Some(session) = self.sessions.get_mut(client_id) else {
            return;
        };
        session.connect(connect.clean_session, connect.will);
        if resumed {
            session.reconnect_reset(&mut self.store, &self.config.limits, now);
            info!(
                "Client {} resumed session with {} stored messages",
                client_id,
                session.record_count()
            );
        } else {
            info!(
                "New client connected as {} (c{})",
                client_id,
                u8::from(connect.clean_session)
            );
        }
    }

    /// Handle DISCONNECT or a lost connection.
    ///
    /// Clean sessions are removed; durable sessions stay for resumption.
    /// The will is published only when the connection was lost.
    pub(crate) fn handle_disconnect(
        &mut self,
        client_id: &str,
        publish_will: bool,
        now: Instant,
    ) -> Result<()> {
        let Some(session) = self.sessions.get_mut(client_id) else {
            return Ok(());
        };
        let will = session.disconnect(unix_time());
        if session.clean_session() {
            self.remove_session(client_id);
            debug!("Removed clean session {}", client_id);
        } else {
            debug!(
                "Client {} disconnected, keeping {} records",
                client_id,
                session.record_count()
            );
        }

        if publish_will {
            if let Some(will) = will {
                if let Err(reason) = validate_topic_name(&will.topic) {
                    debug!("Discarding will of {}: {}", client_id, reason);
                    return Ok(());
                }
                debug!("Publishing will of {} to '{}'", client_id, will.topic);
                self.publish_message(
                    client_id,
                    0,
                    &will.topic,
                    will.payload,
                    will.qos,
                    will.retain,
                    now,
                )?;
            }
        }
        Ok(())
    }
}
