//! Room directory: room existence, kind and membership.

use crate::cache::{self, keys, Cache};
use crate::error::ChatError;
use crate::presence::PresenceTracker;
use crate::store::{ChatStore, StoreError, UserStore};
use parley_protocol::{
    direct_pair_key, Message, Room, RoomId, RoomSummary, UserId, UserWithPresence,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of a direct-room lookup that may have created the room.
#[derive(Debug, Clone)]
pub struct DirectRoom {
    pub room: Room,
    /// Whether this call inserted the room.
    pub created: bool,
}

/// Owns rooms and their participants.
pub struct RoomDirectory {
    chats: Arc<dyn ChatStore>,
    users: Arc<dyn UserStore>,
    cache: Arc<dyn Cache>,
    presence: Arc<PresenceTracker>,
    ttl: Duration,
}

impl RoomDirectory {
    #[must_use]
    pub fn new(
        chats: Arc<dyn ChatStore>,
        users: Arc<dyn UserStore>,
        cache: Arc<dyn Cache>,
        presence: Arc<PresenceTracker>,
        ttl: Duration,
    ) -> Self {
        Self {
            chats,
            users,
            cache,
            presence,
            ttl,
        }
    }

    /// The direct room of a pair, active or not.
    ///
    /// Only the pair-to-id mapping is cached; it never changes once written.
    async fn lookup_direct(&self, a: &UserId, b: &UserId) -> Result<Option<Room>, ChatError> {
        let pair = direct_pair_key(a, b);
        let key = keys::direct_room(&pair);
        let (chats, pair_ref) = (&self.chats, pair.as_str());
        let id: Option<RoomId> = cache::fetch(self.cache.as_ref(), &key, self.ttl, || async move {
            let room = chats.find_room_by_pair_key(pair_ref).await?;
            Ok::<_, StoreError>(room.map(|r| r.id))
        })
        .await?;

        let Some(id) = id else {
            return Ok(None);
        };
        match self.chats.find_room(&id).await? {
            Some(room) => Ok(Some(room)),
            None => {
                warn!(room = %id, "Direct room mapping points nowhere");
                let _ = cache::invalidate(self.cache.as_ref(), &key).await; // logged
                Ok(self.chats.find_room_by_pair_key(&pair).await?)
            }
        }
    }

    /// Look up the active direct room of two users, in either order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn find_direct_room(&self, a: &UserId, b: &UserId) -> Result<Option<Room>, ChatError> {
        Ok(self.lookup_direct(a, b).await?.filter(|r| r.is_active))
    }

    /// Get the direct room of two users, creating it if needed.
    ///
    /// Concurrent callers for the same pair converge on one room: the store
    /// rejects a second row for the pair key, and the loser reads the
    /// winner's row. An inactive room is reactivated.
    ///
    /// # Errors
    ///
    /// [`ChatError::InvalidParticipants`] for a self-pair,
    /// [`ChatError::UserNotFound`] for an unknown counterpart.
    pub async fn get_or_create_direct_room(
        &self,
        me: &UserId,
        other: &UserId,
    ) -> Result<DirectRoom, ChatError> {
        if me == other {
            return Err(ChatError::InvalidParticipants(
                "cannot open a direct room with yourself".to_string(),
            ));
        }
        if self.users.find_user(other).await?.is_none() {
            return Err(ChatError::UserNotFound(other.clone()));
        }

        if let Some(room) = self.lookup_direct(me, other).await? {
            return self.reactivate(room).await;
        }

        let room = Room::direct(me.clone(), other.clone());
        match self.chats.insert_room(room.clone()).await {
            Ok(()) => {
                info!(room = %room.id, user = %me, counterpart = %other, "Created direct room");
                self.invalidate_user_rooms(room.participant_ids.iter()).await;
                Ok(DirectRoom {
                    room,
                    created: true,
                })
            }
            Err(StoreError::Conflict(reason)) => {
                debug!(user = %me, counterpart = %other, "Lost direct room race, re-reading");
                match self
                    .chats
                    .find_room_by_pair_key(&direct_pair_key(me, other))
                    .await?
                {
                    Some(room) => self.reactivate(room).await,
                    None => Err(ChatError::Conflict(reason)),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn reactivate(&self, mut room: Room) -> Result<DirectRoom, ChatError> {
        if !room.is_active {
            self.chats.set_room_active(&room.id, true).await?;
            room.is_active = true;
            info!(room = %room.id, "Reactivated direct room");
            self.invalidate_user_rooms(room.participant_ids.iter()).await;
        }
        Ok(DirectRoom {
            room,
            created: false,
        })
    }

    /// Create a named group room. The owner is a participant implicitly.
    ///
    /// # Errors
    ///
    /// [`ChatError::InvalidParticipants`] if `members` is empty, has
    /// duplicates or lists the owner; [`ChatError::UserNotFound`] for an
    /// unknown member.
    pub async fn create_group_room(
        &self,
        owner: &UserId,
        members: &[UserId],
        name: &str,
    ) -> Result<Room, ChatError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ChatError::InvalidPayload("Room name is required".to_string()));
        }
        if members.is_empty() {
            return Err(ChatError::InvalidParticipants(
                "at least one member is required".to_string(),
            ));
        }
        if members.contains(owner) {
            return Err(ChatError::InvalidParticipants(
                "owner must not be listed as a member".to_string(),
            ));
        }
        let mut participants: BTreeSet<UserId> = BTreeSet::new();
        for member in members {
            if !participants.insert(member.clone()) {
                return Err(ChatError::InvalidParticipants(format!(
                    "duplicate member {member}"
                )));
            }
        }
        for member in members {
            if self.users.find_user(member).await?.is_none() {
                return Err(ChatError::UserNotFound(member.clone()));
            }
        }
        participants.insert(owner.clone());

        let room = Room::group(name, participants);
        self.chats.insert_room(room.clone()).await?;
        info!(room = %room.id, user = %owner, members = members.len(), "Created group room");
        self.invalidate_user_rooms(room.participant_ids.iter()).await;
        Ok(room)
    }

    /// An active room by id.
    ///
    /// # Errors
    ///
    /// [`ChatError::RoomNotFound`] if it does not exist or was deactivated.
    pub async fn get_room(&self, id: &RoomId) -> Result<Room, ChatError> {
        match self.chats.find_room(id).await? {
            Some(room) if room.is_active => Ok(room),
            _ => Err(ChatError::RoomNotFound(*id)),
        }
    }

    /// The user's rooms, newest activity first, each with its last message
    /// and, for direct rooms, the counterpart's live presence.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn list_user_rooms(&self, user: &UserId) -> Result<Vec<RoomSummary>, ChatError> {
        let key = keys::user_rooms(user);
        let chats = &self.chats;
        let summaries: Vec<RoomSummary> = cache::fetch(self.cache.as_ref(), &key, self.ttl, || async move {
            let rooms = chats.rooms_for_user(user).await?;
            let ids: Vec<_> = rooms.iter().filter_map(|r| r.last_message_id).collect();
            let mut last: HashMap<_, Message> = chats
                .find_messages(&ids)
                .await?
                .into_iter()
                .map(|m| (m.id, m))
                .collect();
            let summaries = rooms
                .into_iter()
                .map(|room| RoomSummary {
                    last_message: room.last_message_id.and_then(|id| last.remove(&id)),
                    room,
                    counterpart: None,
                })
                .collect::<Vec<_>>();
            Ok::<_, ChatError>(Some(summaries))
        })
        .await?
        .unwrap_or_default();

        self.annotate(user, summaries).await
    }

    /// One room as the viewer sees it in a chat list.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn summary(&self, room: Room, viewer: &UserId) -> Result<RoomSummary, ChatError> {
        let id = room.id;
        let last_message = match room.last_message_id {
            Some(id) => self.chats.find_message(&id).await?,
            None => None,
        };
        let summary = RoomSummary {
            room,
            last_message,
            counterpart: None,
        };
        let mut annotated = self.annotate(viewer, vec![summary]).await?;
        annotated.pop().ok_or(ChatError::RoomNotFound(id))
    }

    /// Attach live counterpart presence. Never cached.
    async fn annotate(
        &self,
        viewer: &UserId,
        mut summaries: Vec<RoomSummary>,
    ) -> Result<Vec<RoomSummary>, ChatError> {
        let counterparts: Vec<UserId> = summaries
            .iter()
            .filter_map(|s| s.room.counterpart(viewer).cloned())
            .collect();
        if counterparts.is_empty() {
            return Ok(summaries);
        }

        let statuses = self.presence.bulk_status(&counterparts).await?;
        let mut by_user = HashMap::with_capacity(counterparts.len());
        for (id, status) in counterparts.iter().zip(statuses) {
            if let Some(user) = self.users.find_user(id).await? {
                by_user.insert(
                    id.clone(),
                    UserWithPresence {
                        user,
                        is_online: status.is_online,
                        last_seen: status.last_seen,
                    },
                );
            }
        }

        for summary in &mut summaries {
            if let Some(other) = summary.room.counterpart(viewer) {
                summary.counterpart = by_user.get(other).cloned();
            }
        }
        Ok(summaries)
    }

    /// Drop cached chat lists after a change to one of the users' rooms.
    ///
    /// Failures are logged; the stale list then lives until its TTL.
    pub async fn invalidate_user_rooms<'a>(&self, users: impl IntoIterator<Item = &'a UserId>) {
        for user in users {
            let _ = cache::invalidate(self.cache.as_ref(), &keys::user_rooms(user)).await;
        }
    }

    /// Soft-delete a room, optionally archiving its messages.
    ///
    /// Group rooms then behave as missing; a direct pair comes back through
    /// [`RoomDirectory::get_or_create_direct_room`].
    ///
    /// # Errors
    ///
    /// [`ChatError::RoomNotFound`] for an unknown room.
    pub async fn deactivate_room(&self, id: &RoomId, archive: bool) -> Result<(), ChatError> {
        let room = self
            .chats
            .find_room(id)
            .await?
            .ok_or(ChatError::RoomNotFound(*id))?;

        self.chats.set_room_active(id, false).await?;
        if archive {
            let removed = self.chats.archive_messages(id).await?;
            info!(room = %id, removed, "Archived room messages");
            let _ = cache::invalidate(self.cache.as_ref(), &keys::recent_messages(id)).await;
            for user in &room.participant_ids {
                let _ = cache::invalidate(self.cache.as_ref(), &keys::unread(id, user)).await;
            }
        }
        info!(room = %id, archive, "Deactivated room");
        self.invalidate_user_rooms(room.participant_ids.iter()).await;
        Ok(())
    }

    /// All users with live presence.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn user_list(&self) -> Result<Vec<UserWithPresence>, ChatError> {
        let users = self.users.list_users().await?;
        let ids: Vec<UserId> = users.iter().map(|u| u.id.clone()).collect();
        let statuses = self.presence.bulk_status(&ids).await?;
        Ok(users
            .into_iter()
            .zip(statuses)
            .map(|(user, status)| UserWithPresence {
                user,
                is_online: status.is_online,
                last_seen: status.last_seen,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::presence::PresenceConfig;
    use crate::session::SessionRegistry;
    use crate::store::MemoryStore;
    use parley_protocol::User;

    struct Fixture {
        directory: Arc<RoomDirectory>,
        store: Arc<MemoryStore>,
        cache: Arc<dyn Cache>,
        presence: Arc<PresenceTracker>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::with_users([
            User::new("u1", "Ann"),
            User::new("u2", "Bob"),
            User::new("u3", "Cy"),
        ]));
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let presence = Arc::new(PresenceTracker::new(
            Arc::clone(&cache),
            Arc::new(SessionRegistry::new()),
            PresenceConfig::default(),
        ));
        let directory = Arc::new(RoomDirectory::new(
            store.clone(),
            store.clone(),
            Arc::clone(&cache),
            Arc::clone(&presence),
            Duration::from_secs(3600),
        ));
        Fixture {
            directory,
            store,
            cache,
            presence,
        }
    }

    #[tokio::test]
    async fn test_get_or_create_is_symmetric() {
        let f = fixture();
        let first = f
            .directory
            .get_or_create_direct_room(&"u1".into(), &"u2".into())
            .await
            .unwrap();
        assert!(first.created);
        let second = f
            .directory
            .get_or_create_direct_room(&"u2".into(), &"u1".into())
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(first.room.id, second.room.id);

        let found = f
            .directory
            .find_direct_room(&"u2".into(), &"u1".into())
            .await
            .unwrap();
        assert_eq!(found.map(|r| r.id), Some(first.room.id));
    }

    #[tokio::test]
    async fn test_dangling_direct_mapping_is_dropped() {
        let f = fixture();
        let (u1, u2) = (UserId::from("u1"), UserId::from("u2"));
        let room = f.directory.get_or_create_direct_room(&u1, &u2).await.unwrap().room;

        let key = keys::direct_room(&direct_pair_key(&u1, &u2));
        let nowhere = serde_json::to_string(&RoomId::generate()).unwrap();
        f.cache.set(&key, nowhere, None).await.unwrap();

        let found = f.directory.find_direct_room(&u2, &u1).await.unwrap();
        assert_eq!(found.map(|r| r.id), Some(room.id));
        assert!(f.cache.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_converges() {
        let f = fixture();
        let mut tasks = Vec::new();
        for i in 0..16 {
            let directory = Arc::clone(&f.directory);
            tasks.push(tokio::spawn(async move {
                let (a, b) = if i % 2 == 0 { ("u1", "u2") } else { ("u2", "u1") };
                directory
                    .get_or_create_direct_room(&a.into(), &b.into())
                    .await
                    .unwrap()
            }));
        }
        let mut ids = BTreeSet::new();
        let mut created = 0;
        for task in tasks {
            let result = task.await.unwrap();
            ids.insert(result.room.id);
            created += usize::from(result.created);
        }
        assert_eq!(ids.len(), 1);
        assert_eq!(created, 1);
        assert_eq!(f.store.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_direct_room_validation() {
        let f = fixture();
        assert!(matches!(
            f.directory
                .get_or_create_direct_room(&"u1".into(), &"u1".into())
                .await,
            Err(ChatError::InvalidParticipants(_))
        ));
        assert!(matches!(
            f.directory
                .get_or_create_direct_room(&"u1".into(), &"ghost".into())
                .await,
            Err(ChatError::UserNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_group_room_validation() {
        let f = fixture();
        let owner = UserId::from("u1");
        let bad = [
            vec![],
            vec![UserId::from("u1")],
            vec![UserId::from("u2"), UserId::from("u2")],
        ];
        for members in bad {
            assert!(matches!(
                f.directory.create_group_room(&owner, &members, "team").await,
                Err(ChatError::InvalidParticipants(_))
            ));
        }
        assert!(matches!(
            f.directory
                .create_group_room(&owner, &[UserId::from("u2")], "  ")
                .await,
            Err(ChatError::InvalidPayload(_))
        ));

        let room = f
            .directory
            .create_group_room(&owner, &[UserId::from("u2"), UserId::from("u3")], "team")
            .await
            .unwrap();
        assert_eq!(room.participant_ids.len(), 3);
        assert!(room.has_participant(&owner));
        assert_eq!(room.name.as_deref(), Some("team"));
    }

    #[tokio::test]
    async fn test_list_user_rooms_is_invalidated_on_create() {
        let f = fixture();
        let u1 = UserId::from("u1");
        assert!(f.directory.list_user_rooms(&u1).await.unwrap().is_empty());

        f.directory
            .get_or_create_direct_room(&u1, &"u2".into())
            .await
            .unwrap();
        let rooms = f.directory.list_user_rooms(&u1).await.unwrap();
        assert_eq!(rooms.len(), 1);
        let counterpart = rooms[0].counterpart.as_ref().unwrap();
        assert_eq!(counterpart.user.id, UserId::from("u2"));
        assert!(!counterpart.is_online);
    }

    #[tokio::test]
    async fn test_presence_is_live_in_cached_list() {
        let f = fixture();
        let u1 = UserId::from("u1");
        f.directory
            .get_or_create_direct_room(&u1, &"u2".into())
            .await
            .unwrap();
        f.directory.list_user_rooms(&u1).await.unwrap();

        f.presence.set_online(&"u2".into()).await.unwrap();
        let rooms = f.directory.list_user_rooms(&u1).await.unwrap();
        assert!(rooms[0].counterpart.as_ref().unwrap().is_online);
    }

    #[tokio::test]
    async fn test_deactivate_and_reactivate() {
        let f = fixture();
        let u1 = UserId::from("u1");
        let group = f
            .directory
            .create_group_room(&u1, &[UserId::from("u2")], "team")
            .await
            .unwrap();
        let direct = f
            .directory
            .get_or_create_direct_room(&u1, &"u3".into())
            .await
            .unwrap()
            .room;

        f.directory.deactivate_room(&group.id, true).await.unwrap();
        f.directory.deactivate_room(&direct.id, false).await.unwrap();
        assert!(matches!(
            f.directory.get_room(&group.id).await,
            Err(ChatError::RoomNotFound(_))
        ));
        assert!(f.directory.list_user_rooms(&u1).await.unwrap().is_empty());
        assert!(f
            .directory
            .find_direct_room(&u1, &"u3".into())
            .await
            .unwrap()
            .is_none());

        let back = f
            .directory
            .get_or_create_direct_room(&"u3".into(), &u1)
            .await
            .unwrap();
        assert_eq!(back.room.id, direct.id);
        assert!(!back.created);
        assert!(back.room.is_active);
        assert_eq!(f.directory.list_user_rooms(&u1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_user_list_with_presence() {
        let f = fixture();
        f.presence.set_online(&"u3".into()).await.unwrap();
        let users = f.directory.user_list().await.unwrap();
        assert_eq!(users.len(), 3);
        let online: Vec<_> = users.iter().filter(|u| u.is_online).map(|u| u.user.id.as_str()).collect();
        assert_eq!(online, vec!["u3"]);
    }
}
