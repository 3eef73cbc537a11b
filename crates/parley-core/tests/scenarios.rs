//! End-to-end chat scenarios through the connection manager, over in-memory
//! backends.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use parley_core::cache::{self, keys};
use parley_core::{
    Backends, Bus, ChatConfig, ChatStore, ConnectionManager, JwtVerifier, LocalBus, MemoryCache,
    MemoryStore, Outbound, Session, StoreError,
};
use parley_protocol::{
    direct_pair_key, ClientEvent, CreateRoom, GetUnreadCount, JoinRoom, LeaveRoom, MarkRead,
    RoomId, SendMessage, ServerEvent, Typing, User, UserId,
};
use std::sync::Arc;
use std::time::Duration;

const SECRET: &str = "scenario-secret";

struct Cluster {
    store: Arc<MemoryStore>,
    cache: Arc<MemoryCache>,
    bus: Arc<LocalBus>,
}

impl Cluster {
    fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::with_users([
                User::new("u1", "Ann"),
                User::new("u2", "Bob"),
                User::new("u3", "Cyd"),
            ])),
            cache: Arc::new(MemoryCache::new()),
            bus: Arc::new(LocalBus::default()),
        }
    }

    /// A node without a bus.
    fn standalone(&self) -> ConnectionManager {
        self.node(None)
    }

    /// A node sharing store, cache and bus with every other bridged node.
    async fn bridged(&self) -> ConnectionManager {
        let bus: Arc<dyn Bus> = self.bus.clone();
        let manager = self.node(Some(bus));
        manager.start().await.unwrap();
        manager
    }

    fn node(&self, bus: Option<Arc<dyn Bus>>) -> ConnectionManager {
        ConnectionManager::new(
            Backends {
                verifier: Arc::new(JwtVerifier::new(SECRET, 0)),
                users: self.store.clone(),
                chats: self.store.clone(),
                cache: self.cache.clone(),
                bus,
            },
            ChatConfig::default(),
        )
    }
}

async fn connect(manager: &ConnectionManager, user: &str) -> (Arc<Session>, Outbound) {
    manager.open_session(UserId::from(user)).await.unwrap()
}

/// Everything queued for a socket until it goes quiet.
async fn drain(outbound: &mut Outbound) -> Vec<Arc<ServerEvent>> {
    let mut events = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(100), outbound.recv()).await {
        events.push(event);
    }
    events
}

fn names(events: &[Arc<ServerEvent>]) -> Vec<&'static str> {
    events.iter().map(|e| e.name()).collect()
}

fn count(events: &[Arc<ServerEvent>], name: &str) -> usize {
    events.iter().filter(|e| e.name() == name).count()
}

fn send_direct(to: &str, text: &str) -> ClientEvent {
    ClientEvent::SendMessage(SendMessage {
        room_id: None,
        receiver_id: Some(to.into()),
        text: text.to_string(),
    })
}

fn join_room(room_id: RoomId) -> ClientEvent {
    ClientEvent::JoinRoom(JoinRoom {
        room_id: Some(room_id),
        receiver_id: None,
    })
}

fn exception_status(events: &[Arc<ServerEvent>]) -> Option<u16> {
    events.iter().find_map(|e| match e.as_ref() {
        ServerEvent::Exception(x) => Some(x.status),
        _ => None,
    })
}

#[tokio::test]
async fn first_direct_message_creates_room_and_notifies_both() {
    let cluster = Cluster::new();
    let manager = cluster.standalone();
    let (a, mut a_out) = connect(&manager, "u1").await;
    let (_b, mut b_out) = connect(&manager, "u2").await;
    drain(&mut a_out).await;
    drain(&mut b_out).await;

    manager.dispatch(&a, send_direct("u2", "hi")).await;

    let room = cluster
        .store
        .find_room_by_pair_key(&direct_pair_key(&"u1".into(), &"u2".into()))
        .await
        .unwrap()
        .expect("direct room created");
    assert!(room.is_direct());
    assert_eq!(cluster.store.room_count().await, 1);
    assert_eq!(cluster.store.message_count().await, 1);

    let message = cluster
        .store
        .recent_messages(&room.id, 10)
        .await
        .unwrap()
        .pop()
        .unwrap();
    assert_eq!(message.sender_id, UserId::from("u1"));
    assert_eq!(message.text, "hi");
    assert_eq!(room.last_message_id, Some(message.id));
    assert_eq!(manager.messages().unread_count(&room.id, &"u2".into()).await.unwrap(), 1);

    let a_events = drain(&mut a_out).await;
    let b_events = drain(&mut b_out).await;
    assert_eq!(count(&b_events, "newMessage"), 1);
    assert_eq!(count(&b_events, "chatList"), 1);
    assert_eq!(count(&a_events, "chatList"), 1);
    assert_eq!(count(&a_events, "exception"), 0);
}

#[tokio::test]
async fn joining_marks_read_and_refreshes_every_subscriber() {
    let cluster = Cluster::new();
    let manager = cluster.standalone();
    let (a, mut a_out) = connect(&manager, "u1").await;
    let (b, mut b_out) = connect(&manager, "u2").await;

    manager.dispatch(&a, send_direct("u2", "hi")).await;
    manager.dispatch(&a, send_direct("u2", "are you there?")).await;
    let room_id = manager
        .directory()
        .find_direct_room(&"u1".into(), &"u2".into())
        .await
        .unwrap()
        .unwrap()
        .id;
    assert_eq!(manager.messages().unread_count(&room_id, &"u2".into()).await.unwrap(), 2);

    manager.dispatch(&a, join_room(room_id)).await;
    drain(&mut a_out).await;
    drain(&mut b_out).await;

    manager.dispatch(&b, join_room(room_id)).await;
    assert_eq!(manager.messages().unread_count(&room_id, &"u2".into()).await.unwrap(), 0);

    let b_events = drain(&mut b_out).await;
    assert_eq!(count(&b_events, "roomInfo"), 1);
    let window = b_events
        .iter()
        .find_map(|e| match e.as_ref() {
            ServerEvent::Messages(m) => Some(m.clone()),
            _ => None,
        })
        .expect("recent window pushed to the joiner");
    assert_eq!(window.len(), 2);
    assert!(window.iter().all(|m| m.is_read));
    assert_eq!(window[0].text, "hi");

    // The other subscriber sees the refreshed read state too.
    let a_events = drain(&mut a_out).await;
    assert_eq!(count(&a_events, "messages"), 1);
}

#[tokio::test]
async fn concurrent_direct_joins_converge_on_one_room() {
    let cluster = Cluster::new();
    let manager = cluster.standalone();
    let (a, mut a_out) = connect(&manager, "u1").await;
    let (b, mut b_out) = connect(&manager, "u2").await;
    drain(&mut a_out).await;
    drain(&mut b_out).await;

    let join_a = ClientEvent::JoinRoom(JoinRoom {
        room_id: None,
        receiver_id: Some("u2".into()),
    });
    let join_b = ClientEvent::JoinRoom(JoinRoom {
        room_id: None,
        receiver_id: Some("u1".into()),
    });
    tokio::join!(manager.dispatch(&a, join_a), manager.dispatch(&b, join_b));

    let room_of = |events: Vec<Arc<ServerEvent>>| {
        events.iter().find_map(|e| match e.as_ref() {
            ServerEvent::RoomInfo(summary) => Some(summary.room.id),
            _ => None,
        })
    };
    let a_room = room_of(drain(&mut a_out).await).unwrap();
    let b_room = room_of(drain(&mut b_out).await).unwrap();
    assert_eq!(a_room, b_room);
    assert_eq!(cluster.store.room_count().await, 1);
}

#[tokio::test]
async fn presence_stays_online_until_last_connection_closes() {
    let cluster = Cluster::new();
    let manager = cluster.standalone();
    let (_watcher, mut watcher_out) = connect(&manager, "u2").await;
    let (phone, _phone_out) = connect(&manager, "u1").await;
    let (laptop, _laptop_out) = connect(&manager, "u1").await;

    // One announcement for u1 despite two sockets.
    let events = drain(&mut watcher_out).await;
    let announced = events
        .iter()
        .filter(|e| matches!(e.as_ref(), ServerEvent::OnlineStatus(s) if s.user_id == UserId::from("u1")))
        .count();
    assert_eq!(announced, 1);

    manager.close_session(&phone).await;
    assert!(manager.presence().is_online(&"u1".into()).await.unwrap());
    assert_eq!(count(&drain(&mut watcher_out).await, "online-status-user"), 0);

    manager.close_session(&laptop).await;
    assert!(!manager.presence().is_online(&"u1".into()).await.unwrap());
    let events = drain(&mut watcher_out).await;
    let offline = events.iter().find_map(|e| match e.as_ref() {
        ServerEvent::OnlineStatus(s) => Some(s.clone()),
        _ => None,
    });
    let offline = offline.expect("offline announcement");
    assert!(!offline.is_online);
    assert!(offline.last_seen.is_some());
}

#[tokio::test]
async fn rejected_sends_write_nothing() {
    let cluster = Cluster::new();
    let manager = cluster.standalone();
    let (a, mut a_out) = connect(&manager, "u1").await;
    let (outsider, mut outsider_out) = connect(&manager, "u3").await;

    manager
        .dispatch(
            &a,
            ClientEvent::CreateRoom(CreateRoom {
                name: "team".to_string(),
                member_ids: vec!["u2".into()],
            }),
        )
        .await;
    let group = manager.directory().list_user_rooms(&"u1".into()).await.unwrap();
    let group_id = group[0].room.id;
    drain(&mut a_out).await;
    drain(&mut outsider_out).await;

    let to_group = |room_id: RoomId| {
        ClientEvent::SendMessage(SendMessage {
            room_id: Some(room_id),
            receiver_id: None,
            text: "let me in".to_string(),
        })
    };

    manager.dispatch(&outsider, to_group(group_id)).await;
    assert_eq!(exception_status(&drain(&mut outsider_out).await), Some(403));

    manager.dispatch(&outsider, to_group(RoomId::generate())).await;
    assert_eq!(exception_status(&drain(&mut outsider_out).await), Some(404));

    manager.dispatch(&a, send_direct("u2", "   ")).await;
    assert_eq!(exception_status(&drain(&mut a_out).await), Some(400));

    assert_eq!(cluster.store.message_count().await, 0);
    // The blank direct message did not create a room either.
    assert_eq!(cluster.store.room_count().await, 1);
}

#[tokio::test]
async fn group_room_flow() {
    let cluster = Cluster::new();
    let manager = cluster.standalone();
    let (a, mut a_out) = connect(&manager, "u1").await;
    let (b, mut b_out) = connect(&manager, "u2").await;
    let (c, mut c_out) = connect(&manager, "u3").await;
    drain(&mut b_out).await;
    drain(&mut c_out).await;

    manager
        .dispatch(
            &a,
            ClientEvent::CreateRoom(CreateRoom {
                name: "launch".to_string(),
                member_ids: vec!["u2".into(), "u3".into()],
            }),
        )
        .await;
    for out in [&mut b_out, &mut c_out] {
        assert_eq!(count(&drain(out).await, "chatList"), 1);
    }
    let room_id = manager.directory().list_user_rooms(&"u2".into()).await.unwrap()[0]
        .room
        .id;

    manager.dispatch(&b, join_room(room_id)).await;
    manager.dispatch(&c, join_room(room_id)).await;
    drain(&mut a_out).await;
    drain(&mut b_out).await;
    drain(&mut c_out).await;

    manager
        .dispatch(
            &a,
            ClientEvent::SendMessage(SendMessage {
                room_id: Some(room_id),
                receiver_id: None,
                text: "ship it".to_string(),
            }),
        )
        .await;
    let b_events = drain(&mut b_out).await;
    // Joined the room and notified personally, delivered once.
    assert_eq!(count(&b_events, "newMessage"), 1);
    assert_eq!(count(&drain(&mut c_out).await, "newMessage"), 1);

    let message_id = b_events
        .iter()
        .find_map(|e| match e.as_ref() {
            ServerEvent::NewMessage(m) => Some(m.id),
            _ => None,
        })
        .unwrap();

    // One reader is not enough for a group message.
    manager
        .dispatch(&b, ClientEvent::MarkRead(MarkRead { message_id }))
        .await;
    let ack = drain(&mut b_out).await;
    assert!(ack.iter().any(|e| matches!(
        e.as_ref(),
        ServerEvent::UnreadCount(u) if u.room_id == room_id && u.count == 0
    )));
    let message = cluster.store.find_message(&message_id).await.unwrap().unwrap();
    assert!(!message.is_read);
    assert_eq!(manager.messages().unread_count(&room_id, &"u3".into()).await.unwrap(), 1);

    manager
        .dispatch(&c, ClientEvent::MarkRead(MarkRead { message_id }))
        .await;
    drain(&mut c_out).await;
    let message = cluster.store.find_message(&message_id).await.unwrap().unwrap();
    assert!(message.is_read);

    manager
        .dispatch(&a, ClientEvent::MarkRead(MarkRead { message_id }))
        .await;
    assert_eq!(exception_status(&drain(&mut a_out).await), Some(400));
}

#[tokio::test]
async fn typing_reaches_other_room_subscribers() {
    let cluster = Cluster::new();
    let manager = cluster.standalone();
    let (a, mut a_out) = connect(&manager, "u1").await;
    let (b, mut b_out) = connect(&manager, "u2").await;
    manager.dispatch(&a, send_direct("u2", "hi")).await;
    let room_id = manager
        .directory()
        .find_direct_room(&"u1".into(), &"u2".into())
        .await
        .unwrap()
        .unwrap()
        .id;
    manager.dispatch(&a, join_room(room_id)).await;
    manager.dispatch(&b, join_room(room_id)).await;
    drain(&mut a_out).await;
    drain(&mut b_out).await;

    let typing = ClientEvent::Typing(Typing {
        room_id,
        is_typing: true,
    });
    manager.dispatch(&a, typing.clone()).await;
    let events = drain(&mut b_out).await;
    assert!(events.iter().any(|e| matches!(
        e.as_ref(),
        ServerEvent::Typing(t) if t.user == UserId::from("u1") && t.is_typing
    )));

    manager.dispatch(&b, ClientEvent::LeaveRoom(LeaveRoom { room_id })).await;
    manager.dispatch(&a, typing).await;
    assert_eq!(count(&drain(&mut b_out).await, "typing"), 0);
}

#[tokio::test]
async fn user_list_and_unread_count() {
    let cluster = Cluster::new();
    let manager = cluster.standalone();
    let (a, mut a_out) = connect(&manager, "u1").await;
    manager.dispatch(&a, send_direct("u2", "ping")).await;
    let room_id = manager
        .directory()
        .find_direct_room(&"u1".into(), &"u2".into())
        .await
        .unwrap()
        .unwrap()
        .id;
    drain(&mut a_out).await;

    manager.dispatch(&a, ClientEvent::GetUserList).await;
    let events = drain(&mut a_out).await;
    let users = events
        .iter()
        .find_map(|e| match e.as_ref() {
            ServerEvent::UserList(users) => Some(users.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(users.len(), 3);
    let online: Vec<_> = users
        .iter()
        .filter(|u| u.is_online)
        .map(|u| u.user.id.clone())
        .collect();
    assert_eq!(online, vec![UserId::from("u1")]);

    let (b, mut b_out) = connect(&manager, "u2").await;
    drain(&mut b_out).await;
    manager
        .dispatch(&b, ClientEvent::GetUnreadCount(GetUnreadCount { room_id }))
        .await;
    let events = drain(&mut b_out).await;
    assert!(events.iter().any(|e| matches!(
        e.as_ref(),
        ServerEvent::UnreadCount(u) if u.count == 1
    )));

    let (c, mut c_out) = connect(&manager, "u3").await;
    drain(&mut c_out).await;
    manager
        .dispatch(&c, ClientEvent::GetUnreadCount(GetUnreadCount { room_id }))
        .await;
    assert_eq!(exception_status(&drain(&mut c_out).await), Some(403));
}

#[tokio::test]
async fn connect_lists_existing_rooms() {
    let cluster = Cluster::new();
    let manager = cluster.standalone();
    let (a, mut a_out) = connect(&manager, "u1").await;
    manager.dispatch(&a, send_direct("u2", "before you arrived")).await;
    drain(&mut a_out).await;

    let (_b, mut b_out) = connect(&manager, "u2").await;
    let events = drain(&mut b_out).await;
    let chats = events
        .iter()
        .find_map(|e| match e.as_ref() {
            ServerEvent::UserAllChats(rooms) => Some(rooms.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(chats.len(), 1);
    let summary = &chats[0];
    assert_eq!(summary.last_message.as_ref().unwrap().text, "before you arrived");
    let counterpart = summary.counterpart.as_ref().unwrap();
    assert_eq!(counterpart.user.id, UserId::from("u1"));
    assert!(counterpart.is_online);
}

#[tokio::test]
async fn events_cross_nodes_over_the_bus() {
    let cluster = Cluster::new();
    let node_a = cluster.bridged().await;
    let node_b = cluster.bridged().await;

    let (b, mut b_out) = connect(&node_b, "u2").await;
    drain(&mut b_out).await;
    let (a, mut a_out) = connect(&node_a, "u1").await;

    // u1 coming online on node A is announced on node B.
    let events = drain(&mut b_out).await;
    assert!(events.iter().any(|e| matches!(
        e.as_ref(),
        ServerEvent::OnlineStatus(s) if s.user_id == UserId::from("u1") && s.is_online
    )));
    drain(&mut a_out).await;

    node_a.dispatch(&a, send_direct("u2", "across")).await;
    let events = drain(&mut b_out).await;
    assert_eq!(count(&events, "newMessage"), 1, "{:?}", names(&events));
    assert_eq!(count(&events, "chatList"), 1);

    // Presence is shared through the cache.
    assert!(node_a.presence().is_online(&"u2".into()).await.unwrap());
    node_b.close_session(&b).await;
    assert!(!node_a.presence().is_online(&"u2".into()).await.unwrap());
}

#[tokio::test]
async fn presence_counts_sockets_on_every_node() {
    let cluster = Cluster::new();
    let node_a = cluster.bridged().await;
    let node_b = cluster.bridged().await;
    let node_c = cluster.bridged().await;
    let u1 = UserId::from("u1");

    let (_watcher, mut watcher_out) = connect(&node_c, "u2").await;
    drain(&mut watcher_out).await;
    let (phone, _phone_out) = connect(&node_a, "u1").await;
    let (laptop, _laptop_out) = connect(&node_b, "u1").await;
    let events = drain(&mut watcher_out).await;
    assert_eq!(count(&events, "online-status-user"), 1, "{:?}", names(&events));

    // Node B runs out of sockets for u1 while node A still has one.
    node_b.close_session(&laptop).await;
    assert!(node_c.presence().is_online(&u1).await.unwrap());
    assert!(node_b.presence().is_online(&u1).await.unwrap());
    assert_eq!(count(&drain(&mut watcher_out).await, "online-status-user"), 0);

    node_a.close_session(&phone).await;
    assert!(!node_c.presence().is_online(&u1).await.unwrap());
    let events = drain(&mut watcher_out).await;
    assert!(events.iter().any(|e| matches!(
        e.as_ref(),
        ServerEvent::OnlineStatus(s) if s.user_id == u1 && !s.is_online
    )));
}

#[tokio::test]
async fn joining_a_room_refreshes_the_cached_chat_list() {
    let cluster = Cluster::new();
    let manager = cluster.standalone();
    let (a, mut a_out) = connect(&manager, "u1").await;
    let (b, mut b_out) = connect(&manager, "u2").await;
    drain(&mut a_out).await;

    // The send pushes u2 a chat list, which caches the unread summary.
    manager.dispatch(&a, send_direct("u2", "hi")).await;
    let events = drain(&mut b_out).await;
    assert_eq!(count(&events, "chatList"), 1);
    let room_id = cluster
        .store
        .find_room_by_pair_key(&direct_pair_key(&"u1".into(), &"u2".into()))
        .await
        .unwrap()
        .unwrap()
        .id;

    manager.dispatch(&b, join_room(room_id)).await;
    drain(&mut b_out).await;

    let (_b2, mut b2_out) = connect(&manager, "u2").await;
    let chats = drain(&mut b2_out)
        .await
        .iter()
        .find_map(|e| match e.as_ref() {
            ServerEvent::UserAllChats(rooms) => Some(rooms.clone()),
            _ => None,
        })
        .unwrap();
    assert!(chats[0].last_message.as_ref().unwrap().is_read);
}

#[tokio::test]
async fn count_loaded_before_a_send_is_not_cached() {
    let cluster = Cluster::new();
    let node_a = cluster.bridged().await;
    let node_b = cluster.bridged().await;
    let (a, _a_out) = connect(&node_a, "u1").await;
    node_a.dispatch(&a, send_direct("u2", "first")).await;
    let room_id = cluster
        .store
        .find_room_by_pair_key(&direct_pair_key(&"u1".into(), &"u2".into()))
        .await
        .unwrap()
        .unwrap()
        .id;
    let u2 = UserId::from("u2");

    // Node B loads the counter, node A sends before B writes it back.
    let key = keys::unread(&room_id, &u2);
    let stale = cache::fetch(cluster.cache.as_ref(), &key, Duration::from_secs(60), || async {
        let snapshot = cluster.store.count_unread(&room_id, &u2).await?;
        node_a.dispatch(&a, send_direct("u2", "second")).await;
        Ok::<_, StoreError>(Some(snapshot))
    })
    .await
    .unwrap();
    assert_eq!(stale, Some(1));

    assert_eq!(node_b.messages().unread_count(&room_id, &u2).await.unwrap(), 2);
    assert_eq!(node_a.messages().unread_count(&room_id, &u2).await.unwrap(), 2);
}
