#![forbid(unsafe_code)]

// Signaling Orchestrator - dispatches every inbound event, consulting the
// registry and grace controller, driving the media engine, and fanning out
// through the event bus.
//
// Registry reads/writes are individual synchronous steps; no registry lock is
// held across a media or storage await.

use crate::bus::EventBus;
use crate::chat::ChatCoordinator;
use crate::media::MediaEngine;
use crate::metrics::ServerMetrics;
use crate::presence::GraceController;
use crate::registry::{derive_room_id, PresenceRecord, Registry, Room};
use crate::signaling::protocol::{ClientEvent, MemberInfo, ServerEvent};
use anyhow::bail;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_ROOM_ID_LEN: usize = 128;
const MAX_NAME_LEN: usize = 64;
const MAX_CHAT_LEN: usize = 4096;

const ROOM_NOT_FOUND: &str = "Room not found";
const HOST_LEFT_MESSAGE: &str = "Host has left the room";

pub struct Orchestrator {
    registry: Registry,
    bus: EventBus,
    media: Arc<MediaEngine>,
    grace: GraceController,
    chat: ChatCoordinator,
    metrics: ServerMetrics,
}

impl Orchestrator {
    pub fn new(
        media: Arc<MediaEngine>,
        grace: GraceController,
        chat: ChatCoordinator,
        metrics: ServerMetrics,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: Registry::new(),
            bus: EventBus::new(),
            media,
            grace,
            chat,
            metrics,
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn media(&self) -> &Arc<MediaEngine> {
        &self.media
    }

    /// Handles one inbound event to completion. An error is surfaced to the
    /// initiating connection as an `error` event by the caller; the
    /// connection itself is never dropped for application-level failures.
    pub async fn handle_event(
        self: &Arc<Self>,
        connection_id: &str,
        event: ClientEvent,
    ) -> anyhow::Result<()> {
        match event {
            ClientEvent::CreateRoom { host_id, name } => {
                self.create_room(connection_id, &host_id, &name).await
            }
            ClientEvent::ValidateRoom { room_id } => self.validate_room(connection_id, &room_id),
            ClientEvent::JoinRoom {
                room_id,
                member_id,
                name,
            } => self.join_room(connection_id, &room_id, &member_id, &name).await,
            ClientEvent::LeaveRoom { room_id, member_id } => {
                self.leave_room(&room_id, &member_id).await
            }
            ClientEvent::SpinResult { room_id, result } => {
                self.bus
                    .broadcast_except(&room_id, connection_id, &ServerEvent::SpinResult { result });
                Ok(())
            }
            ClientEvent::Offer { offer, to, .. } => {
                self.bus.send_to(
                    &to,
                    &ServerEvent::Offer {
                        offer,
                        from: connection_id.to_string(),
                    },
                );
                Ok(())
            }
            ClientEvent::Answer { room_id, answer } => {
                self.bus.broadcast_except(
                    &room_id,
                    connection_id,
                    &ServerEvent::Answer {
                        answer,
                        from: connection_id.to_string(),
                    },
                );
                Ok(())
            }
            ClientEvent::IceCandidate {
                room_id,
                candidate,
                to,
            } => {
                let event = ServerEvent::IceCandidate {
                    candidate,
                    from: connection_id.to_string(),
                };
                match to {
                    Some(target) => self.bus.send_to(&target, &event),
                    None => self.bus.broadcast_except(&room_id, connection_id, &event),
                }
                Ok(())
            }
            ClientEvent::StopSharing { room_id } => {
                self.bus
                    .broadcast_except(&room_id, connection_id, &ServerEvent::StopSharing);
                Ok(())
            }
            ClientEvent::HostReadyToShare { room_id } => {
                self.host_ready_to_share(connection_id, &room_id)
            }
            ClientEvent::RequestStream { room_id } => {
                self.request_stream(connection_id, &room_id)
            }
            ClientEvent::LivestreamReaction {
                room_id,
                user_name,
                emoji,
                user_id,
            } => {
                // Ephemeral: never persisted, just fanned out with a fresh id.
                self.bus.broadcast(
                    &room_id,
                    &ServerEvent::LivestreamReaction {
                        id: Uuid::new_v4().to_string(),
                        user_name,
                        emoji,
                        user_id,
                    },
                );
                Ok(())
            }
            ClientEvent::UpdateTheme { room_id, theme } => {
                if !self.registry.set_room_theme(&room_id, theme) {
                    bail!("{ROOM_NOT_FOUND}");
                }
                self.bus.broadcast(&room_id, &ServerEvent::ThemeUpdated { theme });
                Ok(())
            }
            ClientEvent::SendMessage {
                user_id,
                user_name,
                message,
                room_id,
            } => {
                self.send_message(&room_id, &user_id, &user_name, &message)
                    .await
            }
            ClientEvent::ReactToMessage {
                room_id,
                message_id,
                user_id,
                emoji,
            } => self.react_to_message(&room_id, &message_id, &user_id, &emoji).await,
            ClientEvent::GetRouterRtpCapabilities { room_id } => {
                self.get_router_rtp_capabilities(connection_id, &room_id).await
            }
            ClientEvent::CreateTransport { room_id, direction } => {
                let transport_id = format!("{connection_id}-{direction}");
                let Some(info) = self
                    .media
                    .create_webrtc_transport(&room_id, &transport_id)
                    .await?
                else {
                    bail!("{ROOM_NOT_FOUND}");
                };
                self.bus.send_to(
                    connection_id,
                    &ServerEvent::TransportCreated {
                        direction,
                        transport_id,
                        transport: info,
                    },
                );
                Ok(())
            }
            ClientEvent::ConnectTransport {
                room_id,
                transport_id,
                dtls_parameters,
            } => {
                if !self
                    .media
                    .connect_transport(&room_id, &transport_id, dtls_parameters)
                    .await?
                {
                    bail!("Transport not found: {transport_id}");
                }
                self.bus.send_to(
                    connection_id,
                    &ServerEvent::TransportConnected { transport_id },
                );
                Ok(())
            }
            ClientEvent::Produce {
                room_id,
                transport_id,
                kind,
                rtp_parameters,
            } => {
                let Some(producer_id) = self
                    .media
                    .produce(&room_id, &transport_id, kind, rtp_parameters)
                    .await?
                else {
                    bail!("Transport not found: {transport_id}");
                };
                self.metrics.inc_producers_created();
                self.bus.send_to(
                    connection_id,
                    &ServerEvent::Produced {
                        kind,
                        id: producer_id.clone(),
                    },
                );
                self.bus.broadcast_except(
                    &room_id,
                    connection_id,
                    &ServerEvent::NewProducer { producer_id, kind },
                );
                Ok(())
            }
            ClientEvent::Consume {
                room_id,
                transport_id,
                producer_id,
                rtp_capabilities,
            } => {
                let Some(info) = self
                    .media
                    .consume(&room_id, &transport_id, &producer_id, rtp_capabilities)
                    .await?
                else {
                    bail!("Producer or transport not found");
                };
                self.metrics.inc_consumers_created();
                self.bus
                    .send_to(connection_id, &ServerEvent::Consumed { consumer: info });
                Ok(())
            }
            ClientEvent::ResumeConsumer {
                room_id,
                consumer_id,
            } => {
                if !self.media.resume_consumer(&room_id, &consumer_id).await? {
                    bail!("Consumer not found: {consumer_id}");
                }
                self.bus
                    .send_to(connection_id, &ServerEvent::ConsumerResumed { consumer_id });
                Ok(())
            }
            ClientEvent::GetProducers { room_id } => {
                let producers = self.media.get_producers(&room_id).await;
                self.bus
                    .send_to(connection_id, &ServerEvent::Producers { producers });
                Ok(())
            }
            ClientEvent::CloseProducer {
                room_id,
                producer_id,
            } => {
                if self.media.close_producer(&room_id, &producer_id).await {
                    self.bus.broadcast_except(
                        &room_id,
                        connection_id,
                        &ServerEvent::ProducerClosed { producer_id },
                    );
                }
                Ok(())
            }
        }
    }

    /// Transport-level disconnect. Arms the grace timer; the departure only
    /// commits if the user has not reappeared by the time it fires.
    pub async fn handle_disconnect(self: &Arc<Self>, connection_id: &str) {
        let Some(user_id) = self.registry.find_user_id_by_socket_id(connection_id) else {
            debug!("Disconnect for unbound connection {}, ignoring", connection_id);
            return;
        };
        info!(
            "Connection {} for user {} lost, starting {:?} grace period",
            connection_id,
            user_id,
            self.grace.grace_period()
        );
        let orchestrator = Arc::clone(self);
        let user = user_id.clone();
        self.grace.arm(&user_id, connection_id, move || async move {
            orchestrator.commit_departure(&user).await;
        });
    }

    /// Runs when a grace timer fires. Re-reads liveness first: the timer is
    /// advisory and a reconnect that raced it wins.
    async fn commit_departure(self: &Arc<Self>, user_id: &str) {
        if let Some(current) = self.registry.get_user_socket(user_id) {
            if self.bus.is_live(&current) {
                debug!("User {} reconnected before grace expiry, keeping session", user_id);
                return;
            }
        }
        match self.registry.get_user_room(user_id) {
            Some(room_id) => self.depart(&room_id, user_id).await,
            None => {
                self.registry.delete_user_socket(user_id);
                self.registry.remove_presence(user_id);
            }
        }
    }

    async fn create_room(
        self: &Arc<Self>,
        connection_id: &str,
        host_id: &str,
        name: &str,
    ) -> anyhow::Result<()> {
        if host_id.is_empty() || host_id.len() > MAX_ROOM_ID_LEN {
            bail!("Invalid host id");
        }
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            bail!("Invalid name: must be 1-{MAX_NAME_LEN} characters");
        }

        self.grace.cancel(host_id);
        let room_id = derive_room_id(host_id);
        let existing = self.registry.find_room_by_id(&room_id);
        let mut host_rejoin_with_viewers = false;

        if let Some(room) = &existing {
            // Tear down the previous connection's media before rebinding.
            if let Some(old_conn) = self.registry.get_user_socket(host_id) {
                if old_conn != connection_id {
                    let closed = self.media.cleanup_user_media(&room_id, &old_conn).await;
                    for producer_id in closed {
                        self.bus
                            .broadcast(&room_id, &ServerEvent::ProducerClosed { producer_id });
                    }
                    // Rebind first, then force-close: the old connection's
                    // disconnect must not find a live binding and arm a
                    // second grace timer over a present user.
                    self.registry.set_user_socket(host_id, connection_id);
                    self.bus.force_close(&old_conn);
                    // Viewers only need to rebuild peer state when the host
                    // actually moved connections; a duplicate create-room on
                    // the bound connection stays quiet.
                    host_rejoin_with_viewers = room.members.len() > 1;
                }
            }
            if room.members.len() <= 1 {
                // Host alone: clean recreate.
                self.registry.remove_member_from_room(&room_id, host_id);
            }
        } else {
            self.leave_previous_room(host_id, &room_id).await;
            self.metrics.inc_rooms_created();
        }

        let room = self.registry.create_room(host_id);
        self.registry.set_user_socket(host_id, connection_id);
        self.registry.set_user_room(host_id, &room.id);
        self.registry.upsert_presence(PresenceRecord {
            user_id: host_id.to_string(),
            name: name.to_string(),
            room_id: Some(room.id.clone()),
            connection_id: connection_id.to_string(),
        });
        self.bus.join_scope(&room.id, connection_id);

        info!("Host {} created room {} on connection {}", host_id, room.id, connection_id);
        self.bus.send_to(
            connection_id,
            &ServerEvent::RoomCreated {
                room_id: room.id.clone(),
                host_id: host_id.to_string(),
                members: self.member_infos(&room.id),
                theme: room.theme,
            },
        );

        if host_rejoin_with_viewers {
            self.bus.broadcast_except(
                &room.id,
                connection_id,
                &ServerEvent::HostReconnected {
                    host_id: host_id.to_string(),
                    host_socket_id: connection_id.to_string(),
                },
            );
        }

        let messages = self.chat.history(&room.id).await;
        self.bus
            .send_to(connection_id, &ServerEvent::ChatHistory { messages });
        Ok(())
    }

    fn validate_room(&self, connection_id: &str, room_id: &str) -> anyhow::Result<()> {
        let room = self.registry.find_room_by_id(room_id);
        self.bus.send_to(
            connection_id,
            &ServerEvent::RoomValidated {
                exists: room.is_some(),
                room_id: room_id.to_string(),
                member_count: room.map(|r| r.members.len()),
            },
        );
        Ok(())
    }

    async fn join_room(
        self: &Arc<Self>,
        connection_id: &str,
        room_id: &str,
        member_id: &str,
        name: &str,
    ) -> anyhow::Result<()> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            bail!("Invalid name: must be 1-{MAX_NAME_LEN} characters");
        }
        let Some(room) = self.registry.find_room_by_id(room_id) else {
            bail!("{ROOM_NOT_FOUND}");
        };

        let was_in_grace = self.grace.cancel(member_id);
        let presence_in_room = self
            .registry
            .get_presence(member_id)
            .is_some_and(|p| p.room_id.as_deref() == Some(room_id));
        let is_reconnect = was_in_grace
            || presence_in_room
            || room.members.iter().any(|m| m == member_id);

        if !is_reconnect {
            let name_taken = self
                .registry
                .presence_in_room(room_id)
                .iter()
                .any(|p| p.name == name && p.user_id != member_id);
            if name_taken {
                bail!(
                    "The name \"{name}\" is already taken in this room. Please choose a different name."
                );
            }
            self.leave_previous_room(member_id, room_id).await;
        } else if let Some(old_conn) = self.registry.get_user_socket(member_id) {
            if old_conn != connection_id {
                // Same rebind-then-disconnect ordering as the host path.
                self.registry.set_user_socket(member_id, connection_id);
                self.bus.force_close(&old_conn);
            }
        }

        self.registry.add_member_to_room(room_id, member_id);
        self.registry.set_user_socket(member_id, connection_id);
        self.registry.set_user_room(member_id, room_id);
        self.registry.upsert_presence(PresenceRecord {
            user_id: member_id.to_string(),
            name: name.to_string(),
            room_id: Some(room_id.to_string()),
            connection_id: connection_id.to_string(),
        });
        self.bus.join_scope(room_id, connection_id);
        self.metrics.inc_joins();

        let members = self.member_infos(room_id);
        info!(
            "{} {} joined room {} ({} members)",
            if is_reconnect { "Reconnecting member" } else { "Member" },
            member_id,
            room_id,
            members.len()
        );

        self.bus.send_to(
            connection_id,
            &ServerEvent::RoomJoined {
                room_id: room_id.to_string(),
                member_id: member_id.to_string(),
                members: members.clone(),
                theme: room.theme,
            },
        );

        if !is_reconnect {
            self.bus.broadcast_except(
                room_id,
                connection_id,
                &ServerEvent::MemberJoined {
                    member_id: member_id.to_string(),
                    name: name.to_string(),
                    members,
                },
            );
        }

        if member_id != room.host_id {
            if let Some(host_conn) = self.registry.get_user_socket(&room.host_id) {
                self.bus.send_to(
                    &host_conn,
                    &ServerEvent::ViewerJoined {
                        viewer_id: connection_id.to_string(),
                    },
                );
            }
        }

        let messages = self.chat.history(room_id).await;
        self.bus
            .send_to(connection_id, &ServerEvent::ChatHistory { messages });
        Ok(())
    }

    async fn leave_room(self: &Arc<Self>, room_id: &str, member_id: &str) -> anyhow::Result<()> {
        self.grace.cancel(member_id);
        self.depart(room_id, member_id).await;
        Ok(())
    }

    /// Commits a member's departure: the host-left rule destroys the room,
    /// a viewer departure shrinks it.
    async fn depart(self: &Arc<Self>, room_id: &str, user_id: &str) {
        let Some(room) = self.registry.find_room_by_id(room_id) else {
            self.registry.delete_user_room(user_id);
            self.registry.delete_user_socket(user_id);
            self.registry.remove_presence(user_id);
            return;
        };

        if user_id == room.host_id {
            self.destroy_room(&room).await;
        } else {
            let connection = self.registry.get_user_socket(user_id);
            let members_after = self
                .registry
                .remove_member_from_room(room_id, user_id)
                .unwrap_or_default();
            if let Some(conn) = &connection {
                self.media
                    .close_transport(room_id, &format!("{conn}-send"))
                    .await;
                self.media
                    .close_transport(room_id, &format!("{conn}-recv"))
                    .await;
            }
            self.bus.broadcast(
                room_id,
                &ServerEvent::MemberLeft {
                    member_id: user_id.to_string(),
                    members: self.infos_for(&members_after),
                },
            );
            if let Some(conn) = &connection {
                self.bus.leave_scope(room_id, conn);
            }
            info!("Viewer {} left room {}", user_id, room_id);
        }

        self.registry.delete_user_room(user_id);
        self.registry.delete_user_socket(user_id);
        self.registry.remove_presence(user_id);
        self.metrics.inc_leaves();
    }

    /// Host is definitively gone: notify, close media, drop the room.
    /// `producerClosed` broadcasts precede `room-deleted`.
    async fn destroy_room(self: &Arc<Self>, room: &Room) {
        let members_after = self
            .registry
            .remove_member_from_room(&room.id, &room.host_id)
            .unwrap_or_default();
        self.bus.broadcast(
            &room.id,
            &ServerEvent::MemberLeft {
                member_id: room.host_id.clone(),
                members: self.infos_for(&members_after),
            },
        );

        for producer_id in self.media.get_producers(&room.id).await {
            self.bus
                .broadcast(&room.id, &ServerEvent::ProducerClosed { producer_id });
        }
        self.bus.broadcast(
            &room.id,
            &ServerEvent::RoomDeleted {
                message: HOST_LEFT_MESSAGE.to_string(),
            },
        );

        self.media.close_room(&room.id).await;
        self.chat.purge_room(&room.id).await;

        if let Some(deleted) = self.registry.delete_room(&room.id) {
            for member in deleted.members {
                self.registry.delete_user_room(&member);
                if let Some(mut presence) = self.registry.get_presence(&member) {
                    presence.room_id = None;
                    self.registry.upsert_presence(presence);
                }
                if let Some(conn) = self.registry.get_user_socket(&member) {
                    self.bus.leave_scope(&room.id, &conn);
                }
            }
        }
        if let Some(host_conn) = self.registry.get_user_socket(&room.host_id) {
            self.bus.leave_scope(&room.id, &host_conn);
        }
        info!("Destroyed room {} after host {} left", room.id, room.host_id);
    }

    /// A user joining somewhere new leaves their previous room first.
    async fn leave_previous_room(self: &Arc<Self>, user_id: &str, next_room_id: &str) {
        let Some(previous) = self.registry.get_user_room(user_id) else {
            return;
        };
        if previous == next_room_id {
            return;
        }
        let members_after = self
            .registry
            .remove_member_from_room(&previous, user_id)
            .unwrap_or_default();
        if let Some(conn) = self.registry.get_user_socket(user_id) {
            self.bus.leave_scope(&previous, &conn);
        }
        self.bus.broadcast(
            &previous,
            &ServerEvent::MemberLeft {
                member_id: user_id.to_string(),
                members: self.infos_for(&members_after),
            },
        );
        self.registry.delete_user_room(user_id);
        debug!("User {} left previous room {}", user_id, previous);
    }

    fn host_ready_to_share(&self, connection_id: &str, room_id: &str) -> anyhow::Result<()> {
        let Some(room) = self.registry.find_room_by_id(room_id) else {
            bail!("{ROOM_NOT_FOUND}");
        };
        let viewer_ids: Vec<String> = room
            .members
            .iter()
            .filter(|m| **m != room.host_id)
            .filter_map(|m| self.registry.get_user_socket(m))
            .collect();
        self.bus
            .send_to(connection_id, &ServerEvent::ExistingViewers { viewer_ids });
        Ok(())
    }

    fn request_stream(&self, connection_id: &str, room_id: &str) -> anyhow::Result<()> {
        let Some(room) = self.registry.find_room_by_id(room_id) else {
            bail!("{ROOM_NOT_FOUND}");
        };
        let Some(host_conn) = self.registry.get_user_socket(&room.host_id) else {
            bail!("Host is not connected");
        };
        self.bus.send_to(
            &host_conn,
            &ServerEvent::RequestStream {
                viewer_id: connection_id.to_string(),
            },
        );
        Ok(())
    }

    async fn get_router_rtp_capabilities(
        self: &Arc<Self>,
        connection_id: &str,
        room_id: &str,
    ) -> anyhow::Result<()> {
        self.media.create_router(room_id).await?;
        let Some(rtp_capabilities) = self.media.get_router_rtp_capabilities(room_id).await else {
            bail!("{ROOM_NOT_FOUND}");
        };
        self.bus.send_to(
            connection_id,
            &ServerEvent::RouterRtpCapabilities { rtp_capabilities },
        );
        Ok(())
    }

    async fn send_message(
        self: &Arc<Self>,
        room_id: &str,
        user_id: &str,
        user_name: &str,
        message: &str,
    ) -> anyhow::Result<()> {
        if message.is_empty() || message.len() > MAX_CHAT_LEN {
            bail!("Invalid chat message: must be 1-{MAX_CHAT_LEN} characters");
        }
        if self.registry.find_room_by_id(room_id).is_none() {
            bail!("{ROOM_NOT_FOUND}");
        }

        let chat_message = self.chat.compose(room_id, user_id, user_name, message);
        // Delivery beats durability: persistence failures are logged inside.
        self.chat.save(&chat_message).await;
        self.bus.broadcast(
            room_id,
            &ServerEvent::ChatMessage {
                message: chat_message,
            },
        );
        Ok(())
    }

    async fn react_to_message(
        self: &Arc<Self>,
        room_id: &str,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> anyhow::Result<()> {
        let reactions = self
            .chat
            .toggle_reaction(room_id, message_id, user_id, emoji)
            .await?;
        self.bus.broadcast(
            room_id,
            &ServerEvent::MessageReactionUpdated {
                message_id: message_id.to_string(),
                reactions,
            },
        );
        Ok(())
    }

    fn member_infos(&self, room_id: &str) -> Vec<MemberInfo> {
        match self.registry.find_room_by_id(room_id) {
            Some(room) => self.infos_for(&room.members),
            None => Vec::new(),
        }
    }

    fn infos_for(&self, members: &[String]) -> Vec<MemberInfo> {
        members
            .iter()
            .map(|user_id| MemberInfo {
                user_id: user_id.clone(),
                name: self
                    .registry
                    .get_presence(user_id)
                    .map(|p| p.name)
                    .unwrap_or_else(|| user_id.clone()),
            })
            .collect()
    }

    /// Topology snapshot for /health and /metrics.
    pub async fn snapshot(&self) -> (usize, usize, usize) {
        (
            self.registry.room_count(),
            self.registry.total_member_count(),
            self.media.worker_count().await,
        )
    }

    /// Tears down every room (members are told `room-deleted`) before the
    /// media engine goes away.
    pub async fn shutdown(self: &Arc<Self>) {
        warn!("Shutting down orchestrator and media engine");
        for room in self.registry.all_rooms() {
            self.destroy_room(&room).await;
            self.registry.delete_user_room(&room.host_id);
            self.registry.delete_user_socket(&room.host_id);
            self.registry.remove_presence(&room.host_id);
        }
        self.media.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ChatCoordinator, JsonStore, WordListFilter};
    use crate::media::MediaConfig;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const GRACE: Duration = Duration::from_millis(150);

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        dir: std::path::PathBuf,
    }

    impl Harness {
        async fn new() -> Self {
            let mut config = MediaConfig::default();
            config.worker = config.worker.with_min_workers(1);
            let media = MediaEngine::new(config).await.expect("media engine");

            let dir = std::env::temp_dir().join(format!("castroom-test-{}", Uuid::new_v4()));
            tokio::fs::create_dir_all(&dir).await.unwrap();
            let store = JsonStore::open(dir.join("chat.json")).await.unwrap();
            let chat = ChatCoordinator::new(Arc::new(store), Arc::new(WordListFilter::default()));

            Self {
                orchestrator: Orchestrator::new(
                    media,
                    GraceController::new(GRACE),
                    chat,
                    ServerMetrics::new(),
                ),
                dir,
            }
        }

        fn connect(&self, connection_id: &str) -> mpsc::Receiver<Arc<String>> {
            let (tx, rx) = mpsc::channel(64);
            self.orchestrator.bus().register(connection_id, tx);
            rx
        }

        /// Mirrors the connection handler's teardown order.
        async fn disconnect(&self, connection_id: &str) {
            self.orchestrator.bus().unregister(connection_id);
            self.orchestrator.handle_disconnect(connection_id).await;
        }

        async fn create_room(&self, conn: &str, host_id: &str, name: &str) {
            self.orchestrator
                .handle_event(
                    conn,
                    ClientEvent::CreateRoom {
                        host_id: host_id.to_string(),
                        name: name.to_string(),
                    },
                )
                .await
                .expect("create-room");
        }

        async fn join_room(
            &self,
            conn: &str,
            room_id: &str,
            member_id: &str,
            name: &str,
        ) -> anyhow::Result<()> {
            self.orchestrator
                .handle_event(
                    conn,
                    ClientEvent::JoinRoom {
                        room_id: room_id.to_string(),
                        member_id: member_id.to_string(),
                        name: name.to_string(),
                    },
                )
                .await
        }

        async fn finish(self) {
            self.orchestrator.shutdown().await;
            tokio::fs::remove_dir_all(&self.dir).await.ok();
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<serde_json::Value> {
        let mut events = Vec::new();
        while let Ok(json) = rx.try_recv() {
            events.push(serde_json::from_str(&json).unwrap());
        }
        events
    }

    fn tags(events: &[serde_json::Value]) -> Vec<&str> {
        events.iter().map(|e| e["type"].as_str().unwrap()).collect()
    }

    fn member_ids(event: &serde_json::Value) -> Vec<&str> {
        event["members"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["userId"].as_str().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn host_create_then_viewer_join() {
        let h = Harness::new().await;
        let mut host_rx = h.connect("c1");
        let mut viewer_rx = h.connect("c2");

        h.create_room("c1", "H", "Alice").await;
        let host_events = drain(&mut host_rx);
        assert_eq!(tags(&host_events), vec!["room-created", "chat-history"]);
        let room_id = host_events[0]["roomId"].as_str().unwrap().to_string();
        assert_eq!(member_ids(&host_events[0]), vec!["H"]);
        assert_eq!(host_events[0]["theme"], "none");

        h.join_room("c2", &room_id, "V", "Bob").await.unwrap();
        let viewer_events = drain(&mut viewer_rx);
        assert_eq!(tags(&viewer_events), vec!["room-joined", "chat-history"]);
        assert_eq!(member_ids(&viewer_events[0]), vec!["H", "V"]);

        let host_events = drain(&mut host_rx);
        assert_eq!(tags(&host_events), vec!["member-joined", "viewer-joined"]);
        assert_eq!(host_events[1]["viewerId"], "c2");

        h.finish().await;
    }

    #[tokio::test]
    async fn duplicate_viewer_name_is_rejected() {
        let h = Harness::new().await;
        let _host_rx = h.connect("c1");
        let _viewer_rx = h.connect("c2");
        let _third_rx = h.connect("c3");

        h.create_room("c1", "H", "Alice").await;
        let room_id = derive_room_id("H");
        h.join_room("c2", &room_id, "V", "Bob").await.unwrap();

        let err = h.join_room("c3", &room_id, "V2", "Bob").await.unwrap_err();
        assert!(err.to_string().contains("\"Bob\" is already taken"));

        let room = h.orchestrator.registry().find_room_by_id(&room_id).unwrap();
        assert_eq!(room.members, vec!["H", "V"]);

        h.finish().await;
    }

    #[tokio::test]
    async fn create_room_twice_yields_same_room_and_presence() {
        let h = Harness::new().await;
        let mut host_rx = h.connect("c1");

        h.create_room("c1", "H", "Alice").await;
        h.create_room("c1", "H", "Alice").await;

        let events = drain(&mut host_rx);
        let created: Vec<&serde_json::Value> = events
            .iter()
            .filter(|e| e["type"] == "room-created")
            .collect();
        assert_eq!(created.len(), 2);
        assert_eq!(created[0]["roomId"], created[1]["roomId"]);

        let room_id = derive_room_id("H");
        let room = h.orchestrator.registry().find_room_by_id(&room_id).unwrap();
        assert_eq!(room.members, vec!["H"]);
        assert_eq!(h.orchestrator.registry().presence_in_room(&room_id).len(), 1);

        h.finish().await;
    }

    #[tokio::test]
    async fn duplicate_create_room_on_same_connection_is_quiet() {
        let h = Harness::new().await;
        let mut host_rx = h.connect("c1");
        let mut viewer_rx = h.connect("c2");

        h.create_room("c1", "H", "Alice").await;
        let room_id = derive_room_id("H");
        h.join_room("c2", &room_id, "V", "Bob").await.unwrap();
        drain(&mut host_rx);
        drain(&mut viewer_rx);

        // Same host, same already-bound connection: a true no-op for viewers.
        h.create_room("c1", "H", "Alice").await;

        let viewer_events = drain(&mut viewer_rx);
        assert!(tags(&viewer_events).iter().all(|t| *t != "host-reconnected"));
        assert!(tags(&viewer_events).iter().all(|t| *t != "producerClosed"));

        let host_events = drain(&mut host_rx);
        assert_eq!(tags(&host_events), vec!["room-created", "chat-history"]);
        assert_eq!(member_ids(&host_events[0]), vec!["H", "V"]);

        let room = h.orchestrator.registry().find_room_by_id(&room_id).unwrap();
        assert_eq!(room.members, vec!["H", "V"]);
        assert_eq!(
            h.orchestrator.registry().get_user_socket("H").as_deref(),
            Some("c1")
        );

        h.finish().await;
    }

    #[tokio::test]
    async fn shutdown_destroys_every_room_and_notifies_members() {
        let h = Harness::new().await;
        let _host_rx = h.connect("c1");
        let mut viewer_rx = h.connect("c2");

        h.create_room("c1", "H", "Alice").await;
        let room_id = derive_room_id("H");
        h.join_room("c2", &room_id, "V", "Bob").await.unwrap();
        drain(&mut viewer_rx);

        h.orchestrator.shutdown().await;

        let viewer_events = drain(&mut viewer_rx);
        let event_tags = tags(&viewer_events);
        let left_pos = event_tags.iter().position(|t| *t == "member-left").unwrap();
        let deleted_pos = event_tags.iter().position(|t| *t == "room-deleted").unwrap();
        assert!(left_pos < deleted_pos);

        assert_eq!(h.orchestrator.registry().room_count(), 0);
        assert!(h.orchestrator.registry().find_room_by_id(&room_id).is_none());
        assert!(h.orchestrator.registry().get_user_socket("H").is_none());
        assert_eq!(h.orchestrator.media().room_count(), 0);

        h.finish().await;
    }

    #[tokio::test]
    async fn reconnect_within_grace_preserves_room_state() {
        let h = Harness::new().await;
        let _host_rx = h.connect("c1");
        let mut viewer_rx = h.connect("c2");

        h.create_room("c1", "H", "Alice").await;
        let room_id = derive_room_id("H");
        h.join_room("c2", &room_id, "V", "Bob").await.unwrap();
        drain(&mut viewer_rx);

        h.disconnect("c2").await;
        let mut viewer_rx = h.connect("c2b");
        h.join_room("c2b", &room_id, "V", "Bob").await.unwrap();

        tokio::time::sleep(GRACE * 3).await;

        // Room unchanged except the connection binding; no duplicate member,
        // no member-left.
        let room = h.orchestrator.registry().find_room_by_id(&room_id).unwrap();
        assert_eq!(room.members, vec!["H", "V"]);
        assert_eq!(
            h.orchestrator.registry().get_user_socket("V").as_deref(),
            Some("c2b")
        );
        let events = drain(&mut viewer_rx);
        assert!(tags(&events).iter().all(|t| *t != "member-left"));

        h.finish().await;
    }

    #[tokio::test]
    async fn reconnect_does_not_rebroadcast_member_joined() {
        let h = Harness::new().await;
        let mut host_rx = h.connect("c1");
        let _viewer_rx = h.connect("c2");

        h.create_room("c1", "H", "Alice").await;
        let room_id = derive_room_id("H");
        h.join_room("c2", &room_id, "V", "Bob").await.unwrap();
        drain(&mut host_rx);

        // Same member joins again from a fresh connection.
        let _viewer2_rx = h.connect("c2b");
        h.join_room("c2b", &room_id, "V", "Bob").await.unwrap();

        let events = drain(&mut host_rx);
        assert!(tags(&events).iter().all(|t| *t != "member-joined"));
        // The host is still told a viewer connection appeared.
        assert!(tags(&events).contains(&"viewer-joined"));

        h.finish().await;
    }

    #[tokio::test]
    async fn host_departure_after_grace_destroys_room() {
        let h = Harness::new().await;
        let _host_rx = h.connect("c1");
        let mut viewer_rx = h.connect("c2");

        h.create_room("c1", "H", "Alice").await;
        let room_id = derive_room_id("H");
        h.join_room("c2", &room_id, "V", "Bob").await.unwrap();
        drain(&mut viewer_rx);

        h.disconnect("c1").await;
        tokio::time::sleep(GRACE * 4).await;

        let events = drain(&mut viewer_rx);
        let event_tags = tags(&events);
        let left_pos = event_tags.iter().position(|t| *t == "member-left").unwrap();
        let deleted_pos = event_tags.iter().position(|t| *t == "room-deleted").unwrap();
        assert!(left_pos < deleted_pos);
        assert_eq!(member_ids(&events[left_pos]), vec!["V"]);
        assert_eq!(events[deleted_pos]["message"], "Host has left the room");

        assert!(h.orchestrator.registry().find_room_by_id(&room_id).is_none());
        assert!(h.orchestrator.registry().presence_in_room(&room_id).is_empty());
        assert_eq!(h.orchestrator.media().room_count(), 0);

        h.finish().await;
    }

    #[tokio::test]
    async fn host_reload_with_viewer_keeps_room_and_notifies() {
        let h = Harness::new().await;
        let _host_rx = h.connect("c1");
        let mut viewer_rx = h.connect("c2");

        h.create_room("c1", "H", "Alice").await;
        let room_id = derive_room_id("H");
        h.join_room("c2", &room_id, "V", "Bob").await.unwrap();
        drain(&mut viewer_rx);

        h.disconnect("c1").await;
        let mut host_rx = h.connect("c1b");
        h.create_room("c1b", "H", "Alice").await;

        tokio::time::sleep(GRACE * 3).await;

        let room = h.orchestrator.registry().find_room_by_id(&room_id).unwrap();
        assert_eq!(room.members, vec!["H", "V"]);
        assert_eq!(
            h.orchestrator.registry().get_user_socket("H").as_deref(),
            Some("c1b")
        );

        let host_events = drain(&mut host_rx);
        assert_eq!(tags(&host_events), vec!["room-created", "chat-history"]);
        assert_eq!(member_ids(&host_events[0]), vec!["H", "V"]);

        let viewer_events = drain(&mut viewer_rx);
        let reconnected = viewer_events
            .iter()
            .find(|e| e["type"] == "host-reconnected")
            .expect("viewer should learn of the host reconnect");
        assert_eq!(reconnected["hostId"], "H");
        assert_eq!(reconnected["hostSocketId"], "c1b");
        // The room survived; nobody was told it was deleted.
        assert!(tags(&viewer_events).iter().all(|t| *t != "room-deleted"));

        h.finish().await;
    }

    #[tokio::test]
    async fn chat_message_round_trip_and_history() {
        let h = Harness::new().await;
        let mut host_rx = h.connect("c1");
        let mut viewer_rx = h.connect("c2");

        h.create_room("c1", "H", "Alice").await;
        let room_id = derive_room_id("H");
        h.join_room("c2", &room_id, "V", "Bob").await.unwrap();
        drain(&mut host_rx);
        drain(&mut viewer_rx);

        h.orchestrator
            .handle_event(
                "c1",
                ClientEvent::SendMessage {
                    user_id: "H".into(),
                    user_name: "Alice".into(),
                    message: "hi".into(),
                    room_id: room_id.clone(),
                },
            )
            .await
            .unwrap();

        let host_events = drain(&mut host_rx);
        let viewer_events = drain(&mut viewer_rx);
        assert_eq!(tags(&host_events), vec!["chat-message"]);
        assert_eq!(tags(&viewer_events), vec!["chat-message"]);
        let message_id = host_events[0]["id"].as_str().unwrap().to_string();
        assert!(!message_id.is_empty());
        assert_eq!(host_events[0]["message"], "hi");

        // A later joiner receives the message in history.
        let mut third_rx = h.connect("c3");
        h.join_room("c3", &room_id, "W", "Carol").await.unwrap();
        let third_events = drain(&mut third_rx);
        let history = third_events
            .iter()
            .find(|e| e["type"] == "chat-history")
            .unwrap();
        let ids: Vec<&str> = history["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap())
            .collect();
        assert!(ids.contains(&message_id.as_str()));

        h.finish().await;
    }

    #[tokio::test]
    async fn reaction_toggles_on_and_off() {
        let h = Harness::new().await;
        let mut host_rx = h.connect("c1");
        let mut viewer_rx = h.connect("c2");

        h.create_room("c1", "H", "Alice").await;
        let room_id = derive_room_id("H");
        h.join_room("c2", &room_id, "V", "Bob").await.unwrap();
        h.orchestrator
            .handle_event(
                "c1",
                ClientEvent::SendMessage {
                    user_id: "H".into(),
                    user_name: "Alice".into(),
                    message: "hi".into(),
                    room_id: room_id.clone(),
                },
            )
            .await
            .unwrap();
        let host_events = drain(&mut host_rx);
        let message_id = host_events
            .iter()
            .find(|e| e["type"] == "chat-message")
            .unwrap()["id"]
            .as_str()
            .unwrap()
            .to_string();
        drain(&mut viewer_rx);

        let react = |h: &Harness| {
            h.orchestrator.handle_event(
                "c2",
                ClientEvent::ReactToMessage {
                    room_id: room_id.clone(),
                    message_id: message_id.clone(),
                    user_id: "V".into(),
                    emoji: "👍".into(),
                },
            )
        };

        react(&h).await.unwrap();
        let events = drain(&mut viewer_rx);
        assert_eq!(tags(&events), vec!["message-reaction-updated"]);
        let reactions = events[0]["reactions"].as_array().unwrap();
        assert_eq!(reactions.len(), 1);
        assert_eq!(reactions[0]["emoji"], "👍");
        assert_eq!(reactions[0]["userIds"], serde_json::json!(["V"]));

        react(&h).await.unwrap();
        let events = drain(&mut viewer_rx);
        assert_eq!(tags(&events), vec!["message-reaction-updated"]);
        assert!(events[0]["reactions"].as_array().unwrap().is_empty());

        h.finish().await;
    }

    #[tokio::test]
    async fn webrtc_relay_targets_and_broadcasts() {
        let h = Harness::new().await;
        let mut host_rx = h.connect("c1");
        let mut viewer_rx = h.connect("c2");

        h.create_room("c1", "H", "Alice").await;
        let room_id = derive_room_id("H");
        h.join_room("c2", &room_id, "V", "Bob").await.unwrap();
        drain(&mut host_rx);
        drain(&mut viewer_rx);

        // Targeted offer host -> viewer connection.
        h.orchestrator
            .handle_event(
                "c1",
                ClientEvent::Offer {
                    room_id: room_id.clone(),
                    offer: serde_json::json!({"sdp": "x"}),
                    to: "c2".into(),
                },
            )
            .await
            .unwrap();
        let events = drain(&mut viewer_rx);
        assert_eq!(tags(&events), vec!["offer"]);
        assert_eq!(events[0]["from"], "c1");
        assert!(drain(&mut host_rx).is_empty());

        // host-ready-to-share answers with the viewers' connection ids.
        h.orchestrator
            .handle_event(
                "c1",
                ClientEvent::HostReadyToShare {
                    room_id: room_id.clone(),
                },
            )
            .await
            .unwrap();
        let events = drain(&mut host_rx);
        assert_eq!(tags(&events), vec!["existing-viewers"]);
        assert_eq!(events[0]["viewerIds"], serde_json::json!(["c2"]));

        // request-stream is forwarded to the host with the requester's id.
        h.orchestrator
            .handle_event(
                "c2",
                ClientEvent::RequestStream {
                    room_id: room_id.clone(),
                },
            )
            .await
            .unwrap();
        let events = drain(&mut host_rx);
        assert_eq!(tags(&events), vec!["request-stream"]);
        assert_eq!(events[0]["viewerId"], "c2");

        h.finish().await;
    }

    #[tokio::test]
    async fn theme_update_broadcasts_to_room() {
        let h = Harness::new().await;
        let mut host_rx = h.connect("c1");
        let mut viewer_rx = h.connect("c2");

        h.create_room("c1", "H", "Alice").await;
        let room_id = derive_room_id("H");
        h.join_room("c2", &room_id, "V", "Bob").await.unwrap();
        drain(&mut host_rx);
        drain(&mut viewer_rx);

        h.orchestrator
            .handle_event(
                "c1",
                ClientEvent::UpdateTheme {
                    room_id: room_id.clone(),
                    theme: crate::registry::RoomTheme::Christmas,
                },
            )
            .await
            .unwrap();

        let events = drain(&mut viewer_rx);
        assert_eq!(tags(&events), vec!["theme-updated"]);
        assert_eq!(events[0]["theme"], "christmas");
        let room = h.orchestrator.registry().find_room_by_id(&room_id).unwrap();
        assert_eq!(room.theme, crate::registry::RoomTheme::Christmas);

        h.finish().await;
    }

    #[tokio::test]
    async fn validate_room_reports_existence() {
        let h = Harness::new().await;
        let mut rx = h.connect("c1");

        h.orchestrator
            .handle_event(
                "c1",
                ClientEvent::ValidateRoom {
                    room_id: "room-missing".into(),
                },
            )
            .await
            .unwrap();
        let events = drain(&mut rx);
        assert_eq!(tags(&events), vec!["room-validated"]);
        assert_eq!(events[0]["exists"], false);

        h.create_room("c1", "H", "Alice").await;
        drain(&mut rx);
        let room_id = derive_room_id("H");
        h.orchestrator
            .handle_event("c1", ClientEvent::ValidateRoom { room_id: room_id.clone() })
            .await
            .unwrap();
        let events = drain(&mut rx);
        assert_eq!(events[0]["exists"], true);
        assert_eq!(events[0]["memberCount"], 1);

        h.finish().await;
    }

    #[tokio::test]
    async fn join_missing_room_errors() {
        let h = Harness::new().await;
        let _rx = h.connect("c1");
        let err = h
            .join_room("c1", "room-000000000000", "V", "Bob")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Room not found"));
        h.finish().await;
    }
}
