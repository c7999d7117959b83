use std::collections::BTreeMap;
use std::sync::Arc;

use config::HistoryConfig;
use domain::{
    DeliveryStatus, Message, MessageCursor, MessageId, MessageKind, MessageStatus, PageDirection,
    RoomId, Timestamp, UserId,
};

use crate::{
    clock::Clock, error::ApplicationError, history_cache::HistoryCache,
    repository::MessageRepository, services::DirectoryService,
};

#[derive(Debug, Clone)]
pub struct CreateMessageRequest {
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub reply_to_id: Option<MessageId>,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub cursor: Option<String>,
    pub limit: Option<u32>,
    pub direction: PageDirection,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub next_cursor: Option<MessageCursor>,
    pub has_more: bool,
}

/// 一次已读标记的结果：按原发送者分组的、真正从未读变为已读的消息
#[derive(Debug, Clone, PartialEq)]
pub struct ReadOutcome {
    pub read_at: Timestamp,
    pub receipts: Vec<(UserId, Vec<MessageId>)>,
}

pub struct MessageServiceDependencies {
    pub message_repository: Arc<dyn MessageRepository>,
    pub directory: Arc<DirectoryService>,
    pub history_cache: Arc<dyn HistoryCache>,
    pub clock: Arc<dyn Clock>,
    pub history: HistoryConfig,
}

/// 消息管道：持久化、状态流转、历史分页
pub struct MessageService {
    deps: MessageServiceDependencies,
}

impl MessageService {
    pub fn new(deps: MessageServiceDependencies) -> Self {
        Self { deps }
    }

    /// 持久化成功后才返回；调用方据此决定是否广播。
    pub async fn create(&self, request: CreateMessageRequest) -> Result<Message, ApplicationError> {
        self.deps
            .directory
            .require_member(request.room_id, request.sender_id)
            .await?;

        if let Some(reply_to_id) = request.reply_to_id {
            let parent = self.deps.message_repository.find_by_id(reply_to_id).await?;
            if parent.map(|m| m.room_id) != Some(request.room_id) {
                return Err(ApplicationError::not_found("message", reply_to_id));
            }
        }

        let message = Message::new(
            request.room_id,
            request.sender_id,
            request.content,
            request.kind,
            request.reply_to_id,
            self.deps.clock.now(),
        )?;

        let mut statuses = vec![MessageStatus::for_sender(&message)];
        for member in self.deps.directory.active_member_ids(message.room_id).await? {
            if member != message.sender_id {
                statuses.push(MessageStatus::for_recipient(&message, member));
            }
        }

        let message = self
            .deps
            .message_repository
            .create_with_statuses(message, statuses)
            .await
            .map_err(|err| {
                tracing::error!(room_id = %request.room_id, error = %err, "消息持久化失败");
                ApplicationError::from(err)
            })?;

        if let Err(err) = self.deps.history_cache.put(message.room_id, &message).await {
            tracing::warn!(room_id = %message.room_id, error = %err, "写入历史缓存失败");
            self.invalidate_cache(message.room_id).await;
        }

        tracing::debug!(message_id = %message.id, room_id = %message.room_id, "消息已持久化");
        Ok(message)
    }

    /// 只有发送者本人可以编辑；已删除的消息不能再编辑。
    pub async fn edit(
        &self,
        room_id: RoomId,
        message_id: MessageId,
        editor: UserId,
        content: String,
    ) -> Result<Message, ApplicationError> {
        let mut message = self.load_own(room_id, message_id, editor).await?;
        message.edit(content, self.deps.clock.now())?;
        let message = self.store_update(message).await?;
        tracing::info!(message_id = %message_id, "消息已编辑");
        Ok(message)
    }

    pub async fn soft_delete(
        &self,
        room_id: RoomId,
        message_id: MessageId,
        actor: UserId,
    ) -> Result<Message, ApplicationError> {
        let mut message = self.load_own(room_id, message_id, actor).await?;
        message.soft_delete(self.deps.clock.now())?;
        let message = self.store_update(message).await?;
        tracing::info!(message_id = %message_id, "消息已删除");
        Ok(message)
    }

    async fn load_own(
        &self,
        room_id: RoomId,
        message_id: MessageId,
        actor: UserId,
    ) -> Result<Message, ApplicationError> {
        self.deps.directory.require_member(room_id, actor).await?;
        let message = self
            .deps
            .message_repository
            .find_by_id(message_id)
            .await?
            .filter(|message| message.room_id == room_id)
            .ok_or_else(|| ApplicationError::not_found("message", message_id))?;
        if message.sender_id != actor {
            return Err(ApplicationError::Unauthorized(
                "only the sender can modify a message".into(),
            ));
        }
        Ok(message)
    }

    async fn store_update(&self, message: Message) -> Result<Message, ApplicationError> {
        let room_id = message.room_id;
        let message_id = message.id;
        let stored = match self.deps.message_repository.update(message).await? {
            Some(stored) => stored,
            // 并发写入中落败：以已存版本为准
            None => {
                let current = self
                    .deps
                    .message_repository
                    .find_by_id(message_id)
                    .await?
                    .ok_or_else(|| ApplicationError::not_found("message", message_id))?;
                if current.is_deleted() {
                    return Err(domain::DomainError::MessageDeleted.into());
                }
                current
            }
        };
        self.invalidate_cache(room_id).await;
        Ok(stored)
    }

    async fn invalidate_cache(&self, room_id: RoomId) {
        if let Err(err) = self.deps.history_cache.invalidate(room_id).await {
            tracing::warn!(room_id = %room_id, error = %err, "历史缓存失效失败");
        }
    }

    /// 把读者在该房间的消息标记为已读，并推进读者的已读指针。
    pub async fn mark_read(
        &self,
        room_id: RoomId,
        reader: UserId,
        message_ids: &[MessageId],
    ) -> Result<ReadOutcome, ApplicationError> {
        let member = self.deps.directory.require_member(room_id, reader).await?;
        let read_at = self.deps.clock.now();

        let messages: BTreeMap<MessageId, Message> = self
            .deps
            .message_repository
            .find_many(message_ids)
            .await?
            .into_iter()
            .filter(|message| message.room_id == room_id)
            .map(|message| (message.id, message))
            .collect();
        if messages.is_empty() {
            return Ok(ReadOutcome {
                read_at,
                receipts: Vec::new(),
            });
        }

        let ids: Vec<MessageId> = messages.keys().copied().collect();
        let changed = self
            .deps
            .message_repository
            .mark_status(&ids, reader, DeliveryStatus::Read, read_at)
            .await?;

        let mut by_sender: BTreeMap<UserId, Vec<MessageId>> = BTreeMap::new();
        for row in &changed {
            if let Some(message) = messages.get(&row.message_id) {
                if message.sender_id != reader {
                    by_sender.entry(message.sender_id).or_default().push(message.id);
                }
            }
        }

        if let Some(newest) = messages.values().max_by_key(|message| message.cursor()) {
            let current = match member.last_read_message_id {
                Some(id) => self.deps.message_repository.find_by_id(id).await?,
                None => None,
            };
            if current.map_or(true, |current| current.cursor() < newest.cursor()) {
                self.deps
                    .directory
                    .update_last_read(room_id, reader, newest.id)
                    .await?;
            }
        }

        Ok(ReadOutcome {
            read_at,
            receipts: by_sender.into_iter().collect(),
        })
    }

    pub async fn mark_delivered(
        &self,
        recipient: UserId,
        message_ids: &[MessageId],
    ) -> Result<usize, ApplicationError> {
        let changed = self
            .deps
            .message_repository
            .mark_status(
                message_ids,
                recipient,
                DeliveryStatus::Delivered,
                self.deps.clock.now(),
            )
            .await?;
        Ok(changed.len())
    }

    /// 离线期间积压的消息，按时间升序
    pub async fn pending_for(
        &self,
        recipient: UserId,
        limit: u32,
    ) -> Result<Vec<Message>, ApplicationError> {
        Ok(self
            .deps
            .message_repository
            .pending_for(recipient, limit)
            .await?)
    }

    pub async fn find_status(
        &self,
        message_id: MessageId,
        recipient: UserId,
    ) -> Result<Option<MessageStatus>, ApplicationError> {
        Ok(self
            .deps
            .message_repository
            .find_status(message_id, recipient)
            .await?)
    }

    /// 历史分页，超时视为存储故障。
    pub async fn history(
        &self,
        room_id: RoomId,
        requester: UserId,
        query: HistoryQuery,
    ) -> Result<MessagePage, ApplicationError> {
        let timeout = self.deps.history.timeout();
        match tokio::time::timeout(timeout, self.load_history(room_id, requester, query)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(room_id = %room_id, timeout_ms = timeout.as_millis() as u64, "历史查询超时");
                Err(ApplicationError::Storage("history request timed out".into()))
            }
        }
    }

    async fn load_history(
        &self,
        room_id: RoomId,
        requester: UserId,
        query: HistoryQuery,
    ) -> Result<MessagePage, ApplicationError> {
        self.deps.directory.require_member(room_id, requester).await?;

        let limit = query
            .limit
            .unwrap_or(self.deps.history.default_page_size)
            .clamp(1, self.deps.history.max_page_size.max(1));
        let cursor = query
            .cursor
            .as_deref()
            .map(MessageCursor::decode)
            .transpose()?;

        // 多取一条用于判断 hasMore
        let fetch = limit + 1;
        let mut messages = None;
        if query.direction == PageDirection::Before {
            match self.deps.history_cache.get(room_id, cursor, fetch as usize).await {
                Ok(hit) => messages = hit,
                Err(err) => {
                    tracing::warn!(room_id = %room_id, error = %err, "读取历史缓存失败，回退到数据库");
                }
            }
        }

        let messages = match messages {
            Some(messages) => messages,
            None => {
                let warm_up = query.direction == PageDirection::Before && cursor.is_none();
                // 必须在读库之前取代数，读库期间的编辑或删除会让这次预热作废
                let generation = if warm_up {
                    match self.deps.history_cache.generation(room_id).await {
                        Ok(generation) => Some(generation),
                        Err(err) => {
                            tracing::warn!(room_id = %room_id, error = %err, "读取缓存代数失败，跳过预热");
                            None
                        }
                    }
                } else {
                    None
                };
                let fetched = self
                    .deps
                    .message_repository
                    .page(room_id, cursor, fetch, query.direction)
                    .await?;
                if let Some(generation) = generation {
                    match self
                        .deps
                        .history_cache
                        .put_many(room_id, generation, &fetched)
                        .await
                    {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::debug!(room_id = %room_id, "缓存在读库期间已失效，放弃预热");
                        }
                        Err(err) => {
                            tracing::warn!(room_id = %room_id, error = %err, "预热历史缓存失败");
                        }
                    }
                }
                fetched
            }
        };

        Ok(paginate(messages, limit as usize))
    }
}

fn paginate(mut messages: Vec<Message>, limit: usize) -> MessagePage {
    let has_more = messages.len() > limit;
    messages.truncate(limit);
    let next_cursor = if has_more {
        messages.last().map(Message::cursor)
    } else {
        None
    };
    MessagePage {
        messages,
        next_cursor,
        has_more,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ErrorCode;
    use crate::history_cache::memory::MemoryHistoryCache;
    use crate::repository::memory::{MemoryMessageRepository, MemoryRoomRepository};
    use crate::repository::MockMessageRepository;
    use crate::services::{CreateGroupRequest, DirectoryServiceDependencies};
    use domain::{RepositoryError, Room};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;
    use uuid::Uuid;

    struct Fixture {
        clock: Arc<ManualClock>,
        directory: Arc<DirectoryService>,
        messages: Arc<MemoryMessageRepository>,
        service: MessageService,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let directory = Arc::new(DirectoryService::new(DirectoryServiceDependencies {
            room_repository: Arc::new(MemoryRoomRepository::new()),
            clock: clock.clone(),
        }));
        let messages = Arc::new(MemoryMessageRepository::new());
        let history = HistoryConfig {
            cache_capacity: 10,
            ..HistoryConfig::default()
        };
        let service = MessageService::new(MessageServiceDependencies {
            message_repository: messages.clone(),
            directory: directory.clone(),
            history_cache: Arc::new(MemoryHistoryCache::new(
                clock.clone(),
                history.cache_capacity,
                16,
                history.cache_ttl(),
            )),
            clock: clock.clone(),
            history,
        });
        Fixture {
            clock,
            directory,
            messages,
            service,
        }
    }

    fn user() -> UserId {
        UserId::from(Uuid::new_v4())
    }

    fn text(room_id: RoomId, sender_id: UserId, content: &str) -> CreateMessageRequest {
        CreateMessageRequest {
            room_id,
            sender_id,
            content: content.into(),
            kind: MessageKind::Text,
            reply_to_id: None,
        }
    }

    async fn direct_room(f: &Fixture, a: UserId, b: UserId) -> Room {
        f.directory.create_direct(a, b).await.unwrap().0
    }

    #[tokio::test]
    async fn create_writes_sender_read_and_recipients_sent() {
        let f = fixture();
        let (a, b) = (user(), user());
        let room = direct_room(&f, a, b).await;

        let message = f.service.create(text(room.id, a, "hello")).await.unwrap();

        let own = f.service.find_status(message.id, a).await.unwrap().unwrap();
        assert_eq!(own.status, DeliveryStatus::Read);
        let theirs = f.service.find_status(message.id, b).await.unwrap().unwrap();
        assert_eq!(theirs.status, DeliveryStatus::Sent);
    }

    #[tokio::test]
    async fn non_members_cannot_send() {
        let f = fixture();
        let (a, b, outsider) = (user(), user(), user());
        let room = direct_room(&f, a, b).await;

        let err = f
            .service
            .create(text(room.id, outsider, "hi"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotAMember);
    }

    #[tokio::test]
    async fn reply_must_point_into_the_same_room() {
        let f = fixture();
        let (a, b, c) = (user(), user(), user());
        let room = direct_room(&f, a, b).await;
        let other = direct_room(&f, a, c).await;
        let parent = f.service.create(text(other.id, a, "elsewhere")).await.unwrap();

        let mut request = text(room.id, a, "reply");
        request.reply_to_id = Some(parent.id);
        let err = f.service.create(request).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn only_sender_edits_and_deleted_cannot_be_edited() {
        let f = fixture();
        let (a, b) = (user(), user());
        let room = direct_room(&f, a, b).await;
        let message = f.service.create(text(room.id, a, "draft")).await.unwrap();

        let err = f
            .service
            .edit(room.id, message.id, b, "hijack".into())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unauthorized);

        f.clock.advance(Duration::from_secs(1));
        let edited = f
            .service
            .edit(room.id, message.id, a, "final".into())
            .await
            .unwrap();
        assert_eq!(edited.content, "final");
        assert!(edited.edited_at.is_some());

        f.clock.advance(Duration::from_secs(1));
        let deleted = f.service.soft_delete(room.id, message.id, a).await.unwrap();
        assert_eq!(deleted.content, domain::DELETED_PLACEHOLDER);

        let err = f
            .service
            .edit(room.id, message.id, a, "again".into())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationFailed);
    }

    #[tokio::test]
    async fn mark_read_reports_receipts_once_and_moves_pointer() {
        let f = fixture();
        let (a, b) = (user(), user());
        let room = direct_room(&f, a, b).await;
        let m1 = f.service.create(text(room.id, a, "one")).await.unwrap();
        f.clock.advance(Duration::from_millis(5));
        let m2 = f.service.create(text(room.id, a, "two")).await.unwrap();

        let outcome = f.service.mark_read(room.id, b, &[m1.id, m2.id]).await.unwrap();
        assert_eq!(outcome.receipts.len(), 1);
        let (sender, mut ids) = outcome.receipts[0].clone();
        ids.sort();
        let mut expected = vec![m1.id, m2.id];
        expected.sort();
        assert_eq!(sender, a);
        assert_eq!(ids, expected);

        let member = f.directory.require_member(room.id, b).await.unwrap();
        assert_eq!(member.last_read_message_id, Some(m2.id));

        // 再次标记不会产生新的回执
        let again = f.service.mark_read(room.id, b, &[m1.id, m2.id]).await.unwrap();
        assert!(again.receipts.is_empty());
    }

    #[tokio::test]
    async fn delivered_then_pending_excludes_message() {
        let f = fixture();
        let (a, b) = (user(), user());
        let room = direct_room(&f, a, b).await;
        let message = f.service.create(text(room.id, a, "queued")).await.unwrap();

        assert_eq!(f.service.pending_for(b, 10).await.unwrap(), vec![message.clone()]);
        assert_eq!(f.service.mark_delivered(b, &[message.id]).await.unwrap(), 1);
        assert!(f.service.pending_for(b, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_pages_backwards_without_gaps() {
        let f = fixture();
        let (a, b) = (user(), user());
        let room = direct_room(&f, a, b).await;
        let mut sent = Vec::new();
        for i in 0..25 {
            f.clock.advance(Duration::from_millis(1));
            sent.push(f.service.create(text(room.id, a, &format!("m{i}"))).await.unwrap());
        }

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = f
                .service
                .history(
                    room.id,
                    b,
                    HistoryQuery {
                        cursor: cursor.map(|c: MessageCursor| c.encode()),
                        limit: Some(10),
                        direction: PageDirection::Before,
                    },
                )
                .await
                .unwrap();
            seen.extend(page.messages.iter().map(|m| m.id));
            if !page.has_more {
                break;
            }
            cursor = page.next_cursor;
        }

        let expected: Vec<MessageId> = sent.iter().rev().map(|m| m.id).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn history_rejects_malformed_cursor_and_clamps_limit() {
        let f = fixture();
        let (a, b) = (user(), user());
        let room = direct_room(&f, a, b).await;
        for _ in 0..3 {
            f.service.create(text(room.id, a, "x")).await.unwrap();
        }

        let err = f
            .service
            .history(
                room.id,
                a,
                HistoryQuery {
                    cursor: Some("not-a-cursor".into()),
                    ..HistoryQuery::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationFailed);

        let page = f
            .service
            .history(
                room.id,
                a,
                HistoryQuery {
                    limit: Some(0),
                    ..HistoryQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.messages.len(), 1);
        assert!(page.has_more);
    }

    #[tokio::test]
    async fn history_after_cursor_returns_newer_messages_oldest_first() {
        let f = fixture();
        let (a, b) = (user(), user());
        let room = direct_room(&f, a, b).await;
        let first = f.service.create(text(room.id, a, "first")).await.unwrap();
        f.clock.advance(Duration::from_millis(1));
        let second = f.service.create(text(room.id, b, "second")).await.unwrap();
        f.clock.advance(Duration::from_millis(1));
        let third = f.service.create(text(room.id, a, "third")).await.unwrap();

        let page = f
            .service
            .history(
                room.id,
                a,
                HistoryQuery {
                    cursor: Some(first.cursor().encode()),
                    limit: Some(5),
                    direction: PageDirection::After,
                },
            )
            .await
            .unwrap();
        let ids: Vec<MessageId> = page.messages.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![second.id, third.id]);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn edits_are_visible_in_history_after_invalidation() {
        let f = fixture();
        let (a, b) = (user(), user());
        let room = direct_room(&f, a, b).await;
        let message = f.service.create(text(room.id, a, "before")).await.unwrap();
        // 预热缓存
        f.service
            .history(room.id, a, HistoryQuery::default())
            .await
            .unwrap();

        f.clock.advance(Duration::from_secs(1));
        f.service
            .edit(room.id, message.id, a, "after".into())
            .await
            .unwrap();

        let page = f
            .service
            .history(room.id, b, HistoryQuery::default())
            .await
            .unwrap();
        assert_eq!(page.messages[0].content, "after");
        let stored = f.messages.find_by_id(message.id).await.unwrap().unwrap();
        assert_eq!(stored.content, "after");
    }

    #[tokio::test]
    async fn group_messages_fan_statuses_to_every_active_member() {
        let f = fixture();
        let (creator, m1, m2) = (user(), user(), user());
        let (room, _) = f
            .directory
            .create_group(CreateGroupRequest {
                creator,
                member_ids: vec![m1, m2],
                name: Some("g".into()),
                is_private: false,
            })
            .await
            .unwrap();
        f.directory.leave_room(room.id, m2).await.unwrap();

        let message = f.service.create(text(room.id, creator, "hey")).await.unwrap();
        assert!(f.service.find_status(message.id, m1).await.unwrap().is_some());
        assert!(f.service.find_status(message.id, m2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn former_members_cannot_edit_or_delete_their_messages() {
        let f = fixture();
        let (creator, m1, m2) = (user(), user(), user());
        let (room, _) = f
            .directory
            .create_group(CreateGroupRequest {
                creator,
                member_ids: vec![m1, m2],
                name: None,
                is_private: false,
            })
            .await
            .unwrap();
        let message = f.service.create(text(room.id, m1, "mine")).await.unwrap();
        f.directory.leave_room(room.id, m1).await.unwrap();

        f.clock.advance(Duration::from_secs(1));
        let err = f
            .service
            .edit(room.id, message.id, m1, "changed".into())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotAMember);
        let err = f
            .service
            .soft_delete(room.id, message.id, m1)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotAMember);

        let stored = f.messages.find_by_id(message.id).await.unwrap().unwrap();
        assert_eq!(stored.content, "mine");
        assert!(!stored.is_deleted());
    }

    #[tokio::test]
    async fn deleted_messages_keep_their_place_and_accept_replies() {
        let f = fixture();
        let (a, b) = (user(), user());
        let room = direct_room(&f, a, b).await;
        let mut sent = Vec::new();
        for content in ["one", "two", "three"] {
            f.clock.advance(Duration::from_millis(1));
            sent.push(f.service.create(text(room.id, a, content)).await.unwrap());
        }

        f.clock.advance(Duration::from_secs(1));
        f.service.soft_delete(room.id, sent[1].id, a).await.unwrap();

        let page = f
            .service
            .history(room.id, b, HistoryQuery::default())
            .await
            .unwrap();
        let ids: Vec<MessageId> = page.messages.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![sent[2].id, sent[1].id, sent[0].id]);
        assert_eq!(page.messages[1].content, domain::DELETED_PLACEHOLDER);
        assert!(page.messages[1].deleted_at.is_some());
        assert_eq!(page.messages[0].content, "three");

        // 从被删除的消息往前翻页，游标仍然有效
        let older = f
            .service
            .history(
                room.id,
                b,
                HistoryQuery {
                    cursor: Some(sent[1].cursor().encode()),
                    limit: Some(5),
                    direction: PageDirection::Before,
                },
            )
            .await
            .unwrap();
        let ids: Vec<MessageId> = older.messages.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![sent[0].id]);

        let mut request = text(room.id, b, "replying anyway");
        request.reply_to_id = Some(sent[1].id);
        let reply = f.service.create(request).await.unwrap();
        assert_eq!(reply.reply_to_id, Some(sent[1].id));
    }

    /// 读完数据库后停住，直到测试放行
    struct PausingPageRepository {
        inner: Arc<MemoryMessageRepository>,
        armed: AtomicBool,
        fetched: Notify,
        resume: Notify,
    }

    #[async_trait]
    impl MessageRepository for PausingPageRepository {
        async fn create_with_statuses(
            &self,
            message: Message,
            statuses: Vec<MessageStatus>,
        ) -> Result<Message, RepositoryError> {
            self.inner.create_with_statuses(message, statuses).await
        }

        async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError> {
            self.inner.find_by_id(id).await
        }

        async fn find_many(&self, ids: &[MessageId]) -> Result<Vec<Message>, RepositoryError> {
            self.inner.find_many(ids).await
        }

        async fn update(&self, message: Message) -> Result<Option<Message>, RepositoryError> {
            self.inner.update(message).await
        }

        async fn page(
            &self,
            room_id: RoomId,
            cursor: Option<MessageCursor>,
            limit: u32,
            direction: PageDirection,
        ) -> Result<Vec<Message>, RepositoryError> {
            let rows = self.inner.page(room_id, cursor, limit, direction).await?;
            if self.armed.swap(false, Ordering::SeqCst) {
                self.fetched.notify_one();
                self.resume.notified().await;
            }
            Ok(rows)
        }

        async fn mark_status(
            &self,
            message_ids: &[MessageId],
            recipient_id: UserId,
            status: DeliveryStatus,
            at: Timestamp,
        ) -> Result<Vec<MessageStatus>, RepositoryError> {
            self.inner
                .mark_status(message_ids, recipient_id, status, at)
                .await
        }

        async fn pending_for(
            &self,
            recipient_id: UserId,
            limit: u32,
        ) -> Result<Vec<Message>, RepositoryError> {
            self.inner.pending_for(recipient_id, limit).await
        }

        async fn find_status(
            &self,
            message_id: MessageId,
            recipient_id: UserId,
        ) -> Result<Option<MessageStatus>, RepositoryError> {
            self.inner.find_status(message_id, recipient_id).await
        }
    }

    #[tokio::test]
    async fn edit_during_history_read_is_not_overwritten_by_warm_up() {
        let clock = Arc::new(ManualClock::default());
        let directory = Arc::new(DirectoryService::new(DirectoryServiceDependencies {
            room_repository: Arc::new(MemoryRoomRepository::new()),
            clock: clock.clone(),
        }));
        let (a, b) = (user(), user());
        let (room, _) = directory.create_direct(a, b).await.unwrap();

        let repo = Arc::new(PausingPageRepository {
            inner: Arc::new(MemoryMessageRepository::new()),
            armed: AtomicBool::new(false),
            fetched: Notify::new(),
            resume: Notify::new(),
        });
        let cache = Arc::new(MemoryHistoryCache::new(
            clock.clone(),
            10,
            16,
            Duration::from_secs(60),
        ));
        let service = Arc::new(MessageService::new(MessageServiceDependencies {
            message_repository: repo.clone(),
            directory,
            history_cache: cache.clone(),
            clock: clock.clone(),
            history: HistoryConfig::default(),
        }));

        let message = service.create(text(room.id, a, "before")).await.unwrap();

        repo.armed.store(true, Ordering::SeqCst);
        let reader = {
            let service = service.clone();
            let room_id = room.id;
            tokio::spawn(async move { service.history(room_id, b, HistoryQuery::default()).await })
        };
        // 读者已拿到旧数据，此时编辑
        repo.fetched.notified().await;
        clock.advance(Duration::from_secs(1));
        service
            .edit(room.id, message.id, a, "after".into())
            .await
            .unwrap();
        repo.resume.notify_one();

        let stale = reader.await.unwrap().unwrap();
        assert_eq!(stale.messages[0].content, "before");

        // 旧数据不能被写回缓存
        let cached = cache.get(room.id, None, 1).await.unwrap();
        assert!(cached.map_or(true, |page| page[0].content != "before"));

        let page = service
            .history(room.id, b, HistoryQuery::default())
            .await
            .unwrap();
        assert_eq!(page.messages[0].content, "after");
    }

    #[tokio::test]
    async fn storage_failure_is_reported_and_not_cached() {
        let clock = Arc::new(ManualClock::default());
        let directory = Arc::new(DirectoryService::new(DirectoryServiceDependencies {
            room_repository: Arc::new(MemoryRoomRepository::new()),
            clock: clock.clone(),
        }));
        let (a, b) = (user(), user());
        let (room, _) = directory.create_direct(a, b).await.unwrap();

        let mut repo = MockMessageRepository::new();
        repo.expect_create_with_statuses()
            .times(1)
            .returning(|_, _| Err(RepositoryError::storage("connection reset")));
        let cache = Arc::new(MemoryHistoryCache::new(
            clock.clone(),
            10,
            16,
            Duration::from_secs(60),
        ));
        let service = MessageService::new(MessageServiceDependencies {
            message_repository: Arc::new(repo),
            directory,
            history_cache: cache.clone(),
            clock,
            history: HistoryConfig::default(),
        });

        let err = service.create(text(room.id, a, "lost")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::StorageFailure);
        assert!(cache.get(room.id, None, 1).await.unwrap().is_none());
    }
}
