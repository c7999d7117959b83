use std::collections::HashMap;
use std::sync::Arc;

use application::{LastSeenRepository, MessageRepository, RoomRepository};
use async_trait::async_trait;
use domain::{
    truncate_to_micros, DeliveryStatus, MediaMetadata, MemberRole, Membership, Message,
    MessageCursor, MessageId, MessageKind, MessageStatus, PageDirection, RepositoryError, Room,
    RoomId, RoomKind, Timestamp, UserId,
};
use sqlx::{postgres::PgPoolOptions, types::Json, FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    match &err {
        sqlx::Error::RowNotFound => RepositoryError::NotFound,
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            RepositoryError::Conflict(db.message().to_string())
        }
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => RepositoryError::NotFound,
        _ => RepositoryError::storage(err.to_string()),
    }
}

fn invalid_data(message: impl Into<String>) -> RepositoryError {
    RepositoryError::storage(message)
}

const MESSAGE_COLUMNS: &str = "id, room_id, sender_id, content, message_type, metadata, reply_to_id, created_at, edited_at, deleted_at";

const MEMBER_COLUMNS: &str = "room_id, user_id, role, joined_at, left_at, last_read_message_id, last_read_at, notifications_enabled";

const ROOM_COLUMNS: &str = "id, kind, name, is_private, created_by, created_at, deleted_at";

#[derive(Debug, FromRow)]
struct RoomRecord {
    id: Uuid,
    kind: String,
    name: Option<String>,
    is_private: bool,
    created_by: Uuid,
    created_at: OffsetDateTime,
    deleted_at: Option<OffsetDateTime>,
}

impl TryFrom<RoomRecord> for Room {
    type Error = RepositoryError;

    fn try_from(value: RoomRecord) -> Result<Self, Self::Error> {
        let kind = RoomKind::parse(&value.kind).map_err(|err| invalid_data(err.to_string()))?;
        Ok(Room {
            id: RoomId::from(value.id),
            kind,
            name: value.name,
            is_private: value.is_private,
            created_by: UserId::from(value.created_by),
            created_at: value.created_at,
            deleted_at: value.deleted_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct MemberRecord {
    room_id: Uuid,
    user_id: Uuid,
    role: String,
    joined_at: OffsetDateTime,
    left_at: Option<OffsetDateTime>,
    last_read_message_id: Option<Uuid>,
    last_read_at: Option<OffsetDateTime>,
    notifications_enabled: bool,
}

impl TryFrom<MemberRecord> for Membership {
    type Error = RepositoryError;

    fn try_from(value: MemberRecord) -> Result<Self, Self::Error> {
        let role = MemberRole::parse(&value.role).map_err(|err| invalid_data(err.to_string()))?;
        Ok(Membership {
            room_id: RoomId::from(value.room_id),
            user_id: UserId::from(value.user_id),
            role,
            joined_at: value.joined_at,
            left_at: value.left_at,
            last_read_message_id: value.last_read_message_id.map(MessageId::from),
            last_read_at: value.last_read_at,
            notifications_enabled: value.notifications_enabled,
        })
    }
}

#[derive(Debug, FromRow)]
struct MessageRecord {
    id: Uuid,
    room_id: Uuid,
    sender_id: Uuid,
    content: String,
    message_type: String,
    metadata: Option<Json<MediaMetadata>>,
    reply_to_id: Option<Uuid>,
    created_at: OffsetDateTime,
    edited_at: Option<OffsetDateTime>,
    deleted_at: Option<OffsetDateTime>,
}

impl TryFrom<MessageRecord> for Message {
    type Error = RepositoryError;

    fn try_from(value: MessageRecord) -> Result<Self, Self::Error> {
        let kind = MessageKind::from_parts(&value.message_type, value.metadata.map(|json| json.0))
            .map_err(|err| invalid_data(err.to_string()))?;
        // 已删除的消息正文是占位文本，不能走 Message::new 的校验
        Ok(Message {
            id: MessageId::from(value.id),
            room_id: RoomId::from(value.room_id),
            sender_id: UserId::from(value.sender_id),
            content: value.content,
            kind,
            reply_to_id: value.reply_to_id.map(MessageId::from),
            created_at: value.created_at,
            edited_at: value.edited_at,
            deleted_at: value.deleted_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct StatusRecord {
    message_id: Uuid,
    recipient_id: Uuid,
    status: String,
    delivered_at: Option<OffsetDateTime>,
    read_at: Option<OffsetDateTime>,
}

impl TryFrom<StatusRecord> for MessageStatus {
    type Error = RepositoryError;

    fn try_from(value: StatusRecord) -> Result<Self, Self::Error> {
        let status =
            DeliveryStatus::parse(&value.status).map_err(|err| invalid_data(err.to_string()))?;
        Ok(MessageStatus {
            message_id: MessageId::from(value.message_id),
            recipient_id: UserId::from(value.recipient_id),
            status,
            delivered_at: value.delivered_at,
            read_at: value.read_at,
        })
    }
}

fn uuids<T: Copy + Into<Uuid>>(ids: &[T]) -> Vec<Uuid> {
    ids.iter().map(|id| (*id).into()).collect()
}

#[derive(Clone)]
pub struct PgRoomRepository {
    pool: PgPool,
}

impl PgRoomRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RoomRepository for PgRoomRepository {
    async fn create_if_absent(
        &self,
        room: Room,
        members: Vec<Membership>,
    ) -> Result<(Room, bool), RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let inserted = sqlx::query_as::<_, RoomRecord>(&format!(
            r#"
            INSERT INTO rooms ({ROOM_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            RETURNING {ROOM_COLUMNS}
            "#
        ))
        .bind(Uuid::from(room.id))
        .bind(room.kind.as_str())
        .bind(room.name.as_deref())
        .bind(room.is_private)
        .bind(Uuid::from(room.created_by))
        .bind(room.created_at)
        .bind(room.deleted_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        let Some(record) = inserted else {
            // 并发创建同一个单聊时，后到者读到已存在的行
            let existing = sqlx::query_as::<_, RoomRecord>(&format!(
                "SELECT {ROOM_COLUMNS} FROM rooms WHERE id = $1"
            ))
            .bind(Uuid::from(room.id))
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
            tx.commit().await.map_err(map_sqlx_err)?;
            return Ok((Room::try_from(existing)?, false));
        };

        for member in &members {
            sqlx::query(&format!(
                r#"
                INSERT INTO room_members ({MEMBER_COLUMNS})
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#
            ))
            .bind(Uuid::from(member.room_id))
            .bind(Uuid::from(member.user_id))
            .bind(member.role.as_str())
            .bind(member.joined_at)
            .bind(member.left_at)
            .bind(member.last_read_message_id.map(Uuid::from))
            .bind(member.last_read_at)
            .bind(member.notifications_enabled)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
        }

        tx.commit().await.map_err(map_sqlx_err)?;
        Ok((Room::try_from(record)?, true))
    }

    async fn find_by_id(&self, id: RoomId) -> Result<Option<Room>, RepositoryError> {
        let record = sqlx::query_as::<_, RoomRecord>(&format!(
            "SELECT {ROOM_COLUMNS} FROM rooms WHERE id = $1"
        ))
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(Room::try_from).transpose()
    }

    async fn find_member(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<Option<Membership>, RepositoryError> {
        let record = sqlx::query_as::<_, MemberRecord>(&format!(
            "SELECT {MEMBER_COLUMNS} FROM room_members WHERE room_id = $1 AND user_id = $2"
        ))
        .bind(Uuid::from(room_id))
        .bind(Uuid::from(user_id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(Membership::try_from).transpose()
    }

    async fn list_members(&self, room_id: RoomId) -> Result<Vec<Membership>, RepositoryError> {
        let records = sqlx::query_as::<_, MemberRecord>(&format!(
            "SELECT {MEMBER_COLUMNS} FROM room_members WHERE room_id = $1 ORDER BY user_id"
        ))
        .bind(Uuid::from(room_id))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(Membership::try_from).collect()
    }

    async fn list_rooms_for(&self, user_id: UserId) -> Result<Vec<Room>, RepositoryError> {
        let records = sqlx::query_as::<_, RoomRecord>(
            r#"
            SELECT r.id, r.kind, r.name, r.is_private, r.created_by, r.created_at, r.deleted_at
            FROM rooms r
            JOIN room_members m ON m.room_id = r.id
            WHERE m.user_id = $1 AND m.role <> 'left' AND r.deleted_at IS NULL
            ORDER BY r.created_at, r.id
            "#,
        )
        .bind(Uuid::from(user_id))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(Room::try_from).collect()
    }

    async fn upsert_member(&self, member: Membership) -> Result<Membership, RepositoryError> {
        let record = sqlx::query_as::<_, MemberRecord>(&format!(
            r#"
            INSERT INTO room_members ({MEMBER_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (room_id, user_id) DO UPDATE SET
                role = EXCLUDED.role,
                joined_at = EXCLUDED.joined_at,
                left_at = EXCLUDED.left_at,
                last_read_message_id = EXCLUDED.last_read_message_id,
                last_read_at = EXCLUDED.last_read_at,
                notifications_enabled = EXCLUDED.notifications_enabled
            RETURNING {MEMBER_COLUMNS}
            "#
        ))
        .bind(Uuid::from(member.room_id))
        .bind(Uuid::from(member.user_id))
        .bind(member.role.as_str())
        .bind(member.joined_at)
        .bind(member.left_at)
        .bind(member.last_read_message_id.map(Uuid::from))
        .bind(member.last_read_at)
        .bind(member.notifications_enabled)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Membership::try_from(record)
    }

    async fn update_last_read(
        &self,
        room_id: RoomId,
        user_id: UserId,
        message_id: MessageId,
        at: Timestamp,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE room_members
            SET last_read_message_id = $3, last_read_at = $4
            WHERE room_id = $1 AND user_id = $2
            "#,
        )
        .bind(Uuid::from(room_id))
        .bind(Uuid::from(user_id))
        .bind(Uuid::from(message_id))
        .bind(truncate_to_micros(at))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct PgMessageRepository {
    pool: PgPool,
}

impl PgMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageRepository for PgMessageRepository {
    async fn create_with_statuses(
        &self,
        message: Message,
        statuses: Vec<MessageStatus>,
    ) -> Result<Message, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let record = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            INSERT INTO messages ({MESSAGE_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(Uuid::from(message.id))
        .bind(Uuid::from(message.room_id))
        .bind(Uuid::from(message.sender_id))
        .bind(message.content.as_str())
        .bind(message.kind.type_name())
        .bind(message.kind.metadata().cloned().map(Json))
        .bind(message.reply_to_id.map(Uuid::from))
        .bind(message.created_at)
        .bind(message.edited_at)
        .bind(message.deleted_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        for status in &statuses {
            sqlx::query(
                r#"
                INSERT INTO message_statuses (message_id, recipient_id, status, delivered_at, read_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(Uuid::from(status.message_id))
            .bind(Uuid::from(status.recipient_id))
            .bind(status.status.as_str())
            .bind(status.delivered_at)
            .bind(status.read_at)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
        }

        tx.commit().await.map_err(map_sqlx_err)?;
        Message::try_from(record)
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError> {
        let record = sqlx::query_as::<_, MessageRecord>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
        ))
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(Message::try_from).transpose()
    }

    async fn find_many(&self, ids: &[MessageId]) -> Result<Vec<Message>, RepositoryError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let records = sqlx::query_as::<_, MessageRecord>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ANY($1)"
        ))
        .bind(uuids(ids))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        // 按调用方给出的顺序返回
        let mut by_id: HashMap<MessageId, Message> = records
            .into_iter()
            .map(|record| Message::try_from(record).map(|message| (message.id, message)))
            .collect::<Result<_, _>>()?;
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn update(&self, message: Message) -> Result<Option<Message>, RepositoryError> {
        // 已删除的行不再接受写入；只有修改时间不早于已存版本的写入生效
        let record = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            UPDATE messages
            SET content = $2, edited_at = $3, deleted_at = $4
            WHERE id = $1
              AND deleted_at IS NULL
              AND (edited_at IS NULL OR edited_at <= GREATEST($3::timestamptz, $4::timestamptz))
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(Uuid::from(message.id))
        .bind(message.content.as_str())
        .bind(message.edited_at)
        .bind(message.deleted_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        match record {
            Some(record) => Message::try_from(record).map(Some),
            None => {
                let exists: bool =
                    sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM messages WHERE id = $1)")
                        .bind(Uuid::from(message.id))
                        .fetch_one(&self.pool)
                        .await
                        .map_err(map_sqlx_err)?;
                if exists {
                    Ok(None)
                } else {
                    Err(RepositoryError::NotFound)
                }
            }
        }
    }

    async fn page(
        &self,
        room_id: RoomId,
        cursor: Option<MessageCursor>,
        limit: u32,
        direction: PageDirection,
    ) -> Result<Vec<Message>, RepositoryError> {
        let (filter, order) = match (direction, cursor.is_some()) {
            (PageDirection::Before, true) => ("AND (created_at, id) < ($3, $4)", "DESC"),
            (PageDirection::Before, false) => ("", "DESC"),
            (PageDirection::After, true) => ("AND (created_at, id) > ($3, $4)", "ASC"),
            (PageDirection::After, false) => ("", "ASC"),
        };
        let sql = format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE room_id = $1 {filter}
            ORDER BY created_at {order}, id {order}
            LIMIT $2
            "#
        );

        let mut query = sqlx::query_as::<_, MessageRecord>(&sql)
            .bind(Uuid::from(room_id))
            .bind(i64::from(limit));
        if let Some(cursor) = cursor {
            query = query.bind(cursor.created_at).bind(Uuid::from(cursor.id));
        }
        let records = query.fetch_all(&self.pool).await.map_err(map_sqlx_err)?;

        records.into_iter().map(Message::try_from).collect()
    }

    async fn mark_status(
        &self,
        message_ids: &[MessageId],
        recipient_id: UserId,
        status: DeliveryStatus,
        at: Timestamp,
    ) -> Result<Vec<MessageStatus>, RepositoryError> {
        // 只推进比目标状态低的行
        let lower: Vec<String> = match status {
            DeliveryStatus::Sent => return Ok(Vec::new()),
            DeliveryStatus::Delivered => vec![DeliveryStatus::Sent.as_str().to_owned()],
            DeliveryStatus::Read => vec![
                DeliveryStatus::Sent.as_str().to_owned(),
                DeliveryStatus::Delivered.as_str().to_owned(),
            ],
        };
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }

        let records = sqlx::query_as::<_, StatusRecord>(
            r#"
            UPDATE message_statuses
            SET status = $3,
                delivered_at = COALESCE(delivered_at, $5),
                read_at = CASE WHEN $3 = 'read' THEN $5 ELSE read_at END
            WHERE message_id = ANY($1) AND recipient_id = $2 AND status = ANY($4)
            RETURNING message_id, recipient_id, status, delivered_at, read_at
            "#,
        )
        .bind(uuids(message_ids))
        .bind(Uuid::from(recipient_id))
        .bind(status.as_str())
        .bind(lower)
        .bind(truncate_to_micros(at))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(MessageStatus::try_from).collect()
    }

    async fn pending_for(
        &self,
        recipient_id: UserId,
        limit: u32,
    ) -> Result<Vec<Message>, RepositoryError> {
        let records = sqlx::query_as::<_, MessageRecord>(
            r#"
            SELECT m.id, m.room_id, m.sender_id, m.content, m.message_type, m.metadata,
                   m.reply_to_id, m.created_at, m.edited_at, m.deleted_at
            FROM message_statuses s
            JOIN messages m ON m.id = s.message_id
            WHERE s.recipient_id = $1 AND s.status = 'sent' AND m.deleted_at IS NULL
            ORDER BY m.created_at, m.id
            LIMIT $2
            "#,
        )
        .bind(Uuid::from(recipient_id))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(Message::try_from).collect()
    }

    async fn find_status(
        &self,
        message_id: MessageId,
        recipient_id: UserId,
    ) -> Result<Option<MessageStatus>, RepositoryError> {
        let record = sqlx::query_as::<_, StatusRecord>(
            r#"
            SELECT message_id, recipient_id, status, delivered_at, read_at
            FROM message_statuses
            WHERE message_id = $1 AND recipient_id = $2
            "#,
        )
        .bind(Uuid::from(message_id))
        .bind(Uuid::from(recipient_id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(MessageStatus::try_from).transpose()
    }
}

#[derive(Clone)]
pub struct PgLastSeenRepository {
    pool: PgPool,
}

impl PgLastSeenRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LastSeenRepository for PgLastSeenRepository {
    async fn record(&self, user_id: UserId, at: Timestamp) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO user_last_seen (user_id, last_seen) VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE SET last_seen = EXCLUDED.last_seen
            "#,
        )
        .bind(Uuid::from(user_id))
        .bind(truncate_to_micros(at))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn find(&self, user_id: UserId) -> Result<Option<Timestamp>, RepositoryError> {
        sqlx::query_scalar("SELECT last_seen FROM user_last_seen WHERE user_id = $1")
            .bind(Uuid::from(user_id))
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)
    }
}

#[derive(Clone)]
pub struct PgStorage {
    pub pool: PgPool,
    pub room_repository: Arc<PgRoomRepository>,
    pub message_repository: Arc<PgMessageRepository>,
    pub last_seen_repository: Arc<PgLastSeenRepository>,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            room_repository: Arc::new(PgRoomRepository::new(pool.clone())),
            message_repository: Arc::new(PgMessageRepository::new(pool.clone())),
            last_seen_repository: Arc::new(PgLastSeenRepository::new(pool.clone())),
            pool,
        }
    }
}

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}
