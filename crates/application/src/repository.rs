use async_trait::async_trait;
use domain::{
    DeliveryStatus, Membership, Message, MessageCursor, MessageId, MessageStatus, PageDirection,
    RepositoryError, Room, RoomId, Timestamp, UserId,
};

#[async_trait]
pub trait RoomRepository: Send + Sync {
    /// 房间不存在时连同成员一并插入；已存在则原样返回，第二个值表示是否新建。
    async fn create_if_absent(
        &self,
        room: Room,
        members: Vec<Membership>,
    ) -> Result<(Room, bool), RepositoryError>;
    async fn find_by_id(&self, id: RoomId) -> Result<Option<Room>, RepositoryError>;
    async fn find_member(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<Option<Membership>, RepositoryError>;
    /// 包含已离开的成员
    async fn list_members(&self, room_id: RoomId) -> Result<Vec<Membership>, RepositoryError>;
    /// 用户仍处于 admin/member 角色且未删除的房间
    async fn list_rooms_for(&self, user_id: UserId) -> Result<Vec<Room>, RepositoryError>;
    async fn upsert_member(&self, member: Membership) -> Result<Membership, RepositoryError>;
    async fn update_last_read(
        &self,
        room_id: RoomId,
        user_id: UserId,
        message_id: MessageId,
        at: Timestamp,
    ) -> Result<(), RepositoryError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// 在同一事务里写入消息与全部投递状态行。
    async fn create_with_statuses(
        &self,
        message: Message,
        statuses: Vec<MessageStatus>,
    ) -> Result<Message, RepositoryError>;

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError>;

    async fn find_many(&self, ids: &[MessageId]) -> Result<Vec<Message>, RepositoryError>;

    /// 写入编辑或删除后的消息。
    ///
    /// 以修改时间做后写者胜出：已删除的消息不再接受写入，修改时间早于已存版本的写入被丢弃。
    /// 写入被丢弃时返回 `None`。
    async fn update(&self, message: Message) -> Result<Option<Message>, RepositoryError>;

    /// 游标分页。`Before` 返回游标之前最近的 `limit` 条（新到旧），
    /// `After` 返回游标之后最近的 `limit` 条（旧到新）。
    async fn page(
        &self,
        room_id: RoomId,
        cursor: Option<MessageCursor>,
        limit: u32,
        direction: PageDirection,
    ) -> Result<Vec<Message>, RepositoryError>;

    /// 推进投递状态，只返回真正发生变化的行。
    async fn mark_status(
        &self,
        message_ids: &[MessageId],
        recipient_id: UserId,
        status: DeliveryStatus,
        at: Timestamp,
    ) -> Result<Vec<MessageStatus>, RepositoryError>;

    /// 尚未投递（状态仍为 sent）的消息，按时间升序。
    async fn pending_for(
        &self,
        recipient_id: UserId,
        limit: u32,
    ) -> Result<Vec<Message>, RepositoryError>;

    async fn find_status(
        &self,
        message_id: MessageId,
        recipient_id: UserId,
    ) -> Result<Option<MessageStatus>, RepositoryError>;
}

/// 断线时间的持久化镜像
#[async_trait]
pub trait LastSeenRepository: Send + Sync {
    async fn record(&self, user_id: UserId, at: Timestamp) -> Result<(), RepositoryError>;
    async fn find(&self, user_id: UserId) -> Result<Option<Timestamp>, RepositoryError>;
}

pub mod memory {
    //! 进程内实现：单实例运行与测试使用。

    use std::collections::{BTreeMap, HashMap};
    use std::ops::Bound;

    use tokio::sync::RwLock;

    use super::*;

    #[derive(Default)]
    struct RoomState {
        rooms: HashMap<RoomId, Room>,
        members: HashMap<RoomId, BTreeMap<UserId, Membership>>,
    }

    #[derive(Default)]
    pub struct MemoryRoomRepository {
        state: RwLock<RoomState>,
    }

    impl MemoryRoomRepository {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl RoomRepository for MemoryRoomRepository {
        async fn create_if_absent(
            &self,
            room: Room,
            members: Vec<Membership>,
        ) -> Result<(Room, bool), RepositoryError> {
            let mut state = self.state.write().await;
            if let Some(existing) = state.rooms.get(&room.id) {
                return Ok((existing.clone(), false));
            }
            let room_members = members
                .into_iter()
                .map(|member| (member.user_id, member))
                .collect();
            state.members.insert(room.id, room_members);
            state.rooms.insert(room.id, room.clone());
            Ok((room, true))
        }

        async fn find_by_id(&self, id: RoomId) -> Result<Option<Room>, RepositoryError> {
            Ok(self.state.read().await.rooms.get(&id).cloned())
        }

        async fn find_member(
            &self,
            room_id: RoomId,
            user_id: UserId,
        ) -> Result<Option<Membership>, RepositoryError> {
            let state = self.state.read().await;
            Ok(state
                .members
                .get(&room_id)
                .and_then(|members| members.get(&user_id))
                .cloned())
        }

        async fn list_members(&self, room_id: RoomId) -> Result<Vec<Membership>, RepositoryError> {
            let state = self.state.read().await;
            Ok(state
                .members
                .get(&room_id)
                .map(|members| members.values().cloned().collect())
                .unwrap_or_default())
        }

        async fn list_rooms_for(&self, user_id: UserId) -> Result<Vec<Room>, RepositoryError> {
            let state = self.state.read().await;
            let mut rooms: Vec<Room> = state
                .members
                .iter()
                .filter(|(_, members)| {
                    members
                        .get(&user_id)
                        .map(|member| member.is_active())
                        .unwrap_or(false)
                })
                .filter_map(|(room_id, _)| state.rooms.get(room_id))
                .filter(|room| !room.is_deleted())
                .cloned()
                .collect();
            rooms.sort_by_key(|room| (room.created_at, room.id));
            Ok(rooms)
        }

        async fn upsert_member(&self, member: Membership) -> Result<Membership, RepositoryError> {
            let mut state = self.state.write().await;
            if !state.rooms.contains_key(&member.room_id) {
                return Err(RepositoryError::NotFound);
            }
            state
                .members
                .entry(member.room_id)
                .or_default()
                .insert(member.user_id, member.clone());
            Ok(member)
        }

        async fn update_last_read(
            &self,
            room_id: RoomId,
            user_id: UserId,
            message_id: MessageId,
            at: Timestamp,
        ) -> Result<(), RepositoryError> {
            let mut state = self.state.write().await;
            let member = state
                .members
                .get_mut(&room_id)
                .and_then(|members| members.get_mut(&user_id))
                .ok_or(RepositoryError::NotFound)?;
            member.record_last_read(message_id, at);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MessageState {
        by_id: HashMap<MessageId, Message>,
        by_room: HashMap<RoomId, BTreeMap<MessageCursor, MessageId>>,
        statuses: BTreeMap<(MessageId, UserId), MessageStatus>,
    }

    #[derive(Default)]
    pub struct MemoryMessageRepository {
        state: RwLock<MessageState>,
    }

    impl MemoryMessageRepository {
        pub fn new() -> Self {
            Self::default()
        }
    }

    fn version(message: &Message) -> Option<Timestamp> {
        message.deleted_at.max(message.edited_at)
    }

    #[async_trait]
    impl MessageRepository for MemoryMessageRepository {
        async fn create_with_statuses(
            &self,
            message: Message,
            statuses: Vec<MessageStatus>,
        ) -> Result<Message, RepositoryError> {
            let mut state = self.state.write().await;
            if state.by_id.contains_key(&message.id) {
                return Err(RepositoryError::Conflict(format!(
                    "message {} already exists",
                    message.id
                )));
            }
            state
                .by_room
                .entry(message.room_id)
                .or_default()
                .insert(message.cursor(), message.id);
            for status in statuses {
                state
                    .statuses
                    .insert((status.message_id, status.recipient_id), status);
            }
            state.by_id.insert(message.id, message.clone());
            Ok(message)
        }

        async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError> {
            Ok(self.state.read().await.by_id.get(&id).cloned())
        }

        async fn find_many(&self, ids: &[MessageId]) -> Result<Vec<Message>, RepositoryError> {
            let state = self.state.read().await;
            Ok(ids
                .iter()
                .filter_map(|id| state.by_id.get(id))
                .cloned()
                .collect())
        }

        async fn update(&self, message: Message) -> Result<Option<Message>, RepositoryError> {
            let mut state = self.state.write().await;
            let stored = state
                .by_id
                .get_mut(&message.id)
                .ok_or(RepositoryError::NotFound)?;
            if stored.is_deleted() || version(&message) < version(stored) {
                return Ok(None);
            }
            stored.content = message.content;
            stored.edited_at = message.edited_at;
            stored.deleted_at = message.deleted_at;
            Ok(Some(stored.clone()))
        }

        async fn page(
            &self,
            room_id: RoomId,
            cursor: Option<MessageCursor>,
            limit: u32,
            direction: PageDirection,
        ) -> Result<Vec<Message>, RepositoryError> {
            let state = self.state.read().await;
            let Some(index) = state.by_room.get(&room_id) else {
                return Ok(Vec::new());
            };
            let limit = limit as usize;
            let ids: Vec<MessageId> = match (direction, cursor) {
                (PageDirection::Before, Some(cursor)) => {
                    index.range(..cursor).rev().take(limit).map(|(_, id)| *id).collect()
                }
                (PageDirection::Before, None) => {
                    index.values().rev().take(limit).copied().collect()
                }
                (PageDirection::After, Some(cursor)) => index
                    .range((Bound::Excluded(cursor), Bound::Unbounded))
                    .take(limit)
                    .map(|(_, id)| *id)
                    .collect(),
                (PageDirection::After, None) => index.values().take(limit).copied().collect(),
            };
            Ok(ids
                .iter()
                .filter_map(|id| state.by_id.get(id))
                .cloned()
                .collect())
        }

        async fn mark_status(
            &self,
            message_ids: &[MessageId],
            recipient_id: UserId,
            status: DeliveryStatus,
            at: Timestamp,
        ) -> Result<Vec<MessageStatus>, RepositoryError> {
            let mut state = self.state.write().await;
            let mut changed = Vec::new();
            for message_id in message_ids {
                if let Some(row) = state.statuses.get_mut(&(*message_id, recipient_id)) {
                    if row.advance(status, at) {
                        changed.push(row.clone());
                    }
                }
            }
            Ok(changed)
        }

        async fn pending_for(
            &self,
            recipient_id: UserId,
            limit: u32,
        ) -> Result<Vec<Message>, RepositoryError> {
            let state = self.state.read().await;
            let mut pending: Vec<Message> = state
                .statuses
                .values()
                .filter(|row| row.recipient_id == recipient_id)
                .filter(|row| row.status == DeliveryStatus::Sent)
                .filter_map(|row| state.by_id.get(&row.message_id))
                .filter(|message| !message.is_deleted())
                .cloned()
                .collect();
            pending.sort_by_key(|message| message.cursor());
            pending.truncate(limit as usize);
            Ok(pending)
        }

        async fn find_status(
            &self,
            message_id: MessageId,
            recipient_id: UserId,
        ) -> Result<Option<MessageStatus>, RepositoryError> {
            let state = self.state.read().await;
            Ok(state.statuses.get(&(message_id, recipient_id)).cloned())
        }
    }

    #[derive(Default)]
    pub struct MemoryLastSeenRepository {
        entries: RwLock<HashMap<UserId, Timestamp>>,
    }

    impl MemoryLastSeenRepository {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl LastSeenRepository for MemoryLastSeenRepository {
        async fn record(&self, user_id: UserId, at: Timestamp) -> Result<(), RepositoryError> {
            self.entries.write().await.insert(user_id, at);
            Ok(())
        }

        async fn find(&self, user_id: UserId) -> Result<Option<Timestamp>, RepositoryError> {
            Ok(self.entries.read().await.get(&user_id).copied())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::*;
    use super::*;
    use domain::{MemberRole, MessageKind};
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn user() -> UserId {
        UserId::from(Uuid::new_v4())
    }

    #[tokio::test]
    async fn create_if_absent_does_not_duplicate_direct_rooms() {
        let repo = MemoryRoomRepository::new();
        let (a, b) = (user(), user());
        let now = OffsetDateTime::now_utc();

        let room = Room::new_direct(a, b, now).unwrap();
        let members = vec![
            Membership::new(room.id, a, MemberRole::Member, now),
            Membership::new(room.id, b, MemberRole::Member, now),
        ];
        let (first, created) = repo.create_if_absent(room, members.clone()).await.unwrap();
        assert!(created);

        let again = Room::new_direct(b, a, now).unwrap();
        let (second, created) = repo.create_if_absent(again, members).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(repo.list_rooms_for(a).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn page_walks_both_directions_without_gaps() {
        let repo = MemoryMessageRepository::new();
        let room_id = RoomId::random();
        let sender = user();
        let start = OffsetDateTime::now_utc();

        let mut sent = Vec::new();
        for i in 0..7 {
            // 相邻两条共享同一时间戳，验证 id 作为次级排序键
            let at = start + time::Duration::milliseconds(i / 2);
            let message =
                Message::new(room_id, sender, format!("m{i}"), MessageKind::Text, None, at)
                    .unwrap();
            sent.push(repo.create_with_statuses(message, vec![]).await.unwrap());
        }

        let mut walked = Vec::new();
        let mut cursor = None;
        loop {
            let page = repo
                .page(room_id, cursor, 3, PageDirection::Before)
                .await
                .unwrap();
            if page.is_empty() {
                break;
            }
            cursor = page.last().map(Message::cursor);
            walked.extend(page);
        }
        let expected: Vec<_> = sent.iter().rev().map(|m| m.id).collect();
        assert_eq!(walked.iter().map(|m| m.id).collect::<Vec<_>>(), expected);

        let after = repo
            .page(room_id, Some(sent[2].cursor()), 2, PageDirection::After)
            .await
            .unwrap();
        assert_eq!(
            after.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![sent[3].id, sent[4].id]
        );
    }

    #[tokio::test]
    async fn update_ignores_writes_after_delete() {
        let repo = MemoryMessageRepository::new();
        let now = OffsetDateTime::now_utc();
        let message =
            Message::new(RoomId::random(), user(), "hi", MessageKind::Text, None, now).unwrap();
        let stored = repo.create_with_statuses(message, vec![]).await.unwrap();

        let mut deleted = stored.clone();
        deleted.soft_delete(now).unwrap();
        assert!(repo.update(deleted).await.unwrap().is_some());

        let mut edited = stored.clone();
        edited.edit("late edit", now + time::Duration::seconds(1)).unwrap();
        assert!(repo.update(edited).await.unwrap().is_none());
    }
}
