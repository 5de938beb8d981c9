use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use dealroom_db::Database;
use dealroom_types::events::{ChannelName, FanoutEvent, GatewayCommand, GatewayEvent};
use dealroom_types::models::Role;

use crate::dispatcher::Dispatcher;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle a WebSocket connection whose token was validated at the HTTP
/// upgrade layer.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    user_id: Uuid,
    role: Role,
) {
    let (mut sender, mut receiver) = socket.split();

    info!("{} ({}) connected to gateway", user_id, role);

    let ready = GatewayEvent::Ready { user_id, role };
    match serde_json::to_string(&ready) {
        Ok(text) => {
            if sender.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
        Err(e) => {
            warn!("Failed to encode Ready frame: {}", e);
            return;
        }
    }

    // Everything bound for the client funnels through one queue
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<GatewayEvent>();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = out_rx.recv() => {
                    let Some(event) = event else { break };
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to encode gateway event: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        let mut subscriptions = Subscriptions::new(dispatcher, out_tx, db.clone());

        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => handle_command(&mut subscriptions, &db, user_id, cmd).await,
                    Err(e) => {
                        warn!(
                            "{} bad command: {} -- raw: {}",
                            user_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!("{} disconnected from gateway", user_id);
}

async fn handle_command(
    subscriptions: &mut Subscriptions,
    db: &Arc<Database>,
    user_id: Uuid,
    cmd: GatewayCommand,
) {
    match cmd {
        GatewayCommand::Subscribe { channel } => {
            let parsed = match channel.parse::<ChannelName>() {
                Ok(parsed) => parsed,
                Err(e) => {
                    subscriptions.deny(channel, e.to_string());
                    return;
                }
            };

            match authorize(db, user_id, parsed).await {
                Ok(access) => {
                    if subscriptions.add(parsed, access, user_id) {
                        debug!("{} subscribed to {} ({:?})", user_id, parsed, access);
                    }
                }
                Err(reason) => {
                    info!("{} denied subscription to {}: {}", user_id, parsed, reason);
                    subscriptions.deny(channel, reason);
                }
            }
        }

        GatewayCommand::Unsubscribe { channel } => match channel.parse::<ChannelName>() {
            Ok(parsed) => {
                if subscriptions.remove(&parsed).await {
                    debug!("{} unsubscribed from {}", user_id, parsed);
                }
            }
            Err(e) => warn!("{} unsubscribe from bad channel '{}': {}", user_id, channel, e),
        },
    }
}

/// What a subscriber may see on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Every event on the channel.
    Full,
    /// Only `new-message` events of conversations the subscriber is in.
    OwnThreads,
}

/// A user channel is private to its user. An entity channel is open in full
/// to the startup's founders; anyone else in one of its conversations only
/// gets the messages of their own threads.
pub async fn authorize(db: &Arc<Database>, user_id: Uuid, channel: ChannelName) -> Result<Access, String> {
    match channel {
        ChannelName::User(owner) if owner == user_id => Ok(Access::Full),
        ChannelName::User(_) => Err("user channels are private".into()),
        ChannelName::Entity(startup_id) => {
            let db = db.clone();
            let (founder, member) = tokio::task::spawn_blocking(move || -> anyhow::Result<(bool, bool)> {
                if db.is_founder(startup_id, user_id)? {
                    return Ok((true, true));
                }
                Ok((false, db.can_view_startup(user_id, startup_id)?))
            })
            .await
            .map_err(|e| format!("join error: {}", e))?
            .map_err(|e| {
                warn!("Subscription check failed: {:#}", e);
                "lookup failed".to_string()
            })?;

            match (founder, member) {
                (true, _) => Ok(Access::Full),
                (false, true) => Ok(Access::OwnThreads),
                (false, false) => Err("not a member of this startup".into()),
            }
        }
    }
}

/// Per-forwarder gate for `Access::OwnThreads`. Participants are fixed when
/// a conversation is created, so each conversation is looked up once.
struct ThreadGate {
    db: Arc<Database>,
    user_id: Uuid,
    admitted: HashSet<Uuid>,
    refused: HashSet<Uuid>,
}

impl ThreadGate {
    async fn admits(&mut self, event: &FanoutEvent) -> bool {
        let FanoutEvent::NewMessage(payload) = event else {
            return false;
        };
        let conversation_id = payload.conversation_id;
        if self.admitted.contains(&conversation_id) {
            return true;
        }
        if self.refused.contains(&conversation_id) {
            return false;
        }

        let db = self.db.clone();
        let user_id = self.user_id;
        let allowed = match tokio::task::spawn_blocking(move || db.is_participant(conversation_id, user_id)).await {
            Ok(Ok(allowed)) => allowed,
            Ok(Err(e)) => {
                warn!("Participation check for {} failed: {:#}", conversation_id, e);
                return false;
            }
            Err(e) => {
                warn!("Participation check for {} panicked: {}", conversation_id, e);
                return false;
            }
        };

        if allowed {
            self.admitted.insert(conversation_id);
        } else {
            self.refused.insert(conversation_id);
        }
        allowed
    }
}

/// One forwarding task per subscribed channel, relaying the channel's events
/// into the connection's outbound queue. Dropping this aborts all of them;
/// hubs left without receivers are pruned on their next publish.
pub struct Subscriptions {
    dispatcher: Dispatcher,
    out: mpsc::UnboundedSender<GatewayEvent>,
    db: Arc<Database>,
    forwarders: HashMap<ChannelName, JoinHandle<()>>,
}

impl Subscriptions {
    pub fn new(dispatcher: Dispatcher, out: mpsc::UnboundedSender<GatewayEvent>, db: Arc<Database>) -> Self {
        Self {
            dispatcher,
            out,
            db,
            forwarders: HashMap::new(),
        }
    }

    /// Returns false if the channel was already subscribed.
    pub fn add(&mut self, channel: ChannelName, access: Access, user_id: Uuid) -> bool {
        if self.forwarders.contains_key(&channel) {
            return false;
        }

        let mut gate = match access {
            Access::Full => None,
            Access::OwnThreads => Some(ThreadGate {
                db: self.db.clone(),
                user_id,
                admitted: HashSet::new(),
                refused: HashSet::new(),
            }),
        };

        let mut rx = self.dispatcher.subscribe(channel);
        let out = self.out.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Some(gate) = gate.as_mut() {
                            if !gate.admits(&event).await {
                                continue;
                            }
                        }
                        if out.send(GatewayEvent::Event { channel, event }).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Subscriber on {} lagged, {} events lost", channel, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.forwarders.insert(channel, handle);
        true
    }

    /// Stop forwarding a channel. Waits for the forwarder to release its
    /// receiver so an unused hub is pruned right away. Returns false if the
    /// channel was not subscribed.
    pub async fn remove(&mut self, channel: &ChannelName) -> bool {
        let Some(handle) = self.forwarders.remove(channel) else {
            return false;
        };
        handle.abort();
        let _ = handle.await;
        self.dispatcher.unsubscribe(channel);
        true
    }

    pub fn deny(&self, channel: String, reason: String) {
        let _ = self.out.send(GatewayEvent::SubscribeDenied { channel, reason });
    }

    pub fn channels(&self) -> impl Iterator<Item = &ChannelName> {
        self.forwarders.keys()
    }
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        for (channel, handle) in self.forwarders.drain() {
            handle.abort();
            self.dispatcher.unsubscribe(&channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dealroom_db::AppendOutcome;
    use dealroom_types::models::{Conversation, Message, Startup, User};

    fn conversation(startup_id: Uuid) -> Conversation {
        let now = Utc::now();
        Conversation {
            id: Uuid::new_v4(),
            startup_id,
            participants: vec![],
            is_team_chat: false,
            last_message: None,
            last_message_at: now,
            message_count: 0,
            created_at: now,
        }
    }

    struct Deal {
        db: Arc<Database>,
        startup: Startup,
        founder: User,
        investors: Vec<(User, Conversation)>,
    }

    fn deal(investors: usize) -> Deal {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let founder = User { id: Uuid::new_v4(), name: "Grace".into(), role: Role::Founder };
        db.upsert_user(&founder).unwrap();
        let startup = Startup { id: Uuid::new_v4(), name: "Lattice".into(), founders: vec![founder.id] };
        db.upsert_startup(&startup).unwrap();

        let investors = (0..investors)
            .map(|i| {
                let investor = User { id: Uuid::new_v4(), name: format!("investor-{}", i), role: Role::Investor };
                db.upsert_user(&investor).unwrap();
                let (c, _) = db.create_direct_conversation(startup.id, founder.id, investor.id).unwrap();
                (investor, c)
            })
            .collect();

        Deal { db, startup, founder, investors }
    }

    fn append(db: &Database, conversation_id: Uuid, sender: Uuid, content: &str) -> Message {
        match db.append_message(conversation_id, sender, content, "text").unwrap() {
            AppendOutcome::Appended(m) => m,
            other => panic!("unexpected {:?}", other),
        }
    }

    fn delivered_content(frame: GatewayEvent) -> String {
        match frame {
            GatewayEvent::Event { event: FanoutEvent::NewMessage(payload), .. } => payload.message.content,
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn subscribed_channel_events_reach_the_outbound_queue() {
        let dispatcher = Dispatcher::new();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let mut subs = Subscriptions::new(dispatcher.clone(), out_tx, db);

        let user_id = Uuid::new_v4();
        let channel = ChannelName::User(user_id);
        assert!(subs.add(channel, Access::Full, user_id));
        assert!(!subs.add(channel, Access::Full, user_id));
        assert_eq!(dispatcher.subscriber_count(&channel), 1);

        let event = FanoutEvent::new_conversation(conversation(Uuid::new_v4()));
        assert_eq!(dispatcher.publish(&channel, event.clone()), 1);

        match out_rx.recv().await.unwrap() {
            GatewayEvent::Event { channel: got, event: delivered } => {
                assert_eq!(got, channel);
                assert_eq!(delivered, event);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn unsubscribe_prunes_the_hub_immediately() {
        let dispatcher = Dispatcher::new();
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let mut subs = Subscriptions::new(dispatcher.clone(), out_tx, db);

        let entity = ChannelName::Entity(Uuid::new_v4());
        subs.add(entity, Access::Full, Uuid::new_v4());
        assert_eq!(dispatcher.channel_count(), 1);

        assert!(subs.remove(&entity).await);
        assert_eq!(dispatcher.channel_count(), 0);
        assert!(!subs.remove(&entity).await);
    }

    #[tokio::test]
    async fn dropping_subscriptions_releases_channels() {
        let dispatcher = Dispatcher::new();
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let mut subs = Subscriptions::new(dispatcher.clone(), out_tx, db);
        let entity = ChannelName::Entity(Uuid::new_v4());
        let user_id = Uuid::new_v4();
        let user = ChannelName::User(user_id);
        subs.add(entity, Access::Full, user_id);
        subs.add(user, Access::Full, user_id);
        assert_eq!(subs.channels().count(), 2);

        drop(subs);

        // Aborted forwarders release their receivers once the runtime
        // reaps them; the next publish prunes the hubs
        let event = FanoutEvent::new_conversation(conversation(Uuid::new_v4()));
        for _ in 0..10 {
            if dispatcher.subscriber_count(&entity) == 0 && dispatcher.subscriber_count(&user) == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(dispatcher.publish(&entity, event.clone()), 0);
        assert_eq!(dispatcher.publish(&user, event), 0);
        assert_eq!(dispatcher.channel_count(), 0);
    }

    #[tokio::test]
    async fn entity_access_depends_on_role_in_the_startup() {
        let d = deal(1);
        let (investor, _) = &d.investors[0];
        let stranger = Uuid::new_v4();
        let entity = ChannelName::Entity(d.startup.id);

        assert_eq!(authorize(&d.db, d.founder.id, ChannelName::User(d.founder.id)).await, Ok(Access::Full));
        assert!(authorize(&d.db, stranger, ChannelName::User(d.founder.id)).await.is_err());
        assert_eq!(authorize(&d.db, d.founder.id, entity).await, Ok(Access::Full));
        assert_eq!(authorize(&d.db, investor.id, entity).await, Ok(Access::OwnThreads));
        assert!(authorize(&d.db, stranger, entity).await.is_err());
    }

    #[tokio::test]
    async fn investors_only_see_their_own_threads_on_the_entity_channel() {
        let d = deal(2);
        let (a, a_thread) = &d.investors[0];
        let (b, b_thread) = &d.investors[1];
        let entity = ChannelName::Entity(d.startup.id);
        let dispatcher = Dispatcher::new();

        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let mut b_subs = Subscriptions::new(dispatcher.clone(), b_tx, d.db.clone());
        let access = authorize(&d.db, b.id, entity).await.unwrap();
        b_subs.add(entity, access, b.id);

        let (f_tx, mut f_rx) = mpsc::unbounded_channel();
        let mut f_subs = Subscriptions::new(dispatcher.clone(), f_tx, d.db.clone());
        let access = authorize(&d.db, d.founder.id, entity).await.unwrap();
        f_subs.add(entity, access, d.founder.id);

        let private = append(&d.db, a_thread.id, a.id, "private terms for A");
        dispatcher.publish(&entity, FanoutEvent::new_message(private));
        let own = append(&d.db, b_thread.id, d.founder.id, "reply to B");
        dispatcher.publish(&entity, FanoutEvent::new_message(own));

        // B's queue skips A's message entirely
        assert_eq!(delivered_content(b_rx.recv().await.unwrap()), "reply to B");
        assert!(b_rx.try_recv().is_err());

        assert_eq!(delivered_content(f_rx.recv().await.unwrap()), "private terms for A");
        assert_eq!(delivered_content(f_rx.recv().await.unwrap()), "reply to B");
    }
}
