use std::collections::{HashMap, HashSet, VecDeque};

use domain::{RoomId, UserId};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::broadcaster::{Audience, EventEnvelope};
use crate::events::ServerEvent;

/// 每个连接记住的最近事件 ID 数量
const RECENT_EVENTS_PER_CONNECTION: usize = 256;

/// 有界的已投递事件窗口，用于丢弃重复投递
#[derive(Debug)]
pub struct RecentEvents {
    capacity: usize,
    order: VecDeque<Uuid>,
    seen: HashSet<Uuid>,
}

impl RecentEvents {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// 首次出现返回 true
    pub fn insert(&mut self, event_id: Uuid) -> bool {
        if !self.seen.insert(event_id) {
            return false;
        }
        self.order.push_back(event_id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

struct ConnectionEntry {
    user_id: UserId,
    sender: mpsc::UnboundedSender<ServerEvent>,
    rooms: HashSet<RoomId>,
    recent: RecentEvents,
}

impl ConnectionEntry {
    fn push(&mut self, event_id: Option<Uuid>, event: ServerEvent) -> bool {
        if let Some(event_id) = event_id {
            if !self.recent.insert(event_id) {
                tracing::debug!(event_id = %event_id, "丢弃重复事件");
                return false;
            }
        }
        self.sender.send(event).is_ok()
    }
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<Uuid, ConnectionEntry>,
    by_user: HashMap<UserId, HashSet<Uuid>>,
    by_room: HashMap<RoomId, HashSet<Uuid>>,
}

/// 本实例持有的连接表
///
/// 维护 连接 → 用户、用户 → 连接、房间 → 连接 三张映射。
#[derive(Default)]
pub struct ConnectionRegistry {
    state: RwLock<RegistryState>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        connection_id: Uuid,
        user_id: UserId,
        sender: mpsc::UnboundedSender<ServerEvent>,
    ) {
        let mut state = self.state.write().await;
        state.connections.insert(
            connection_id,
            ConnectionEntry {
                user_id,
                sender,
                rooms: HashSet::new(),
                recent: RecentEvents::new(RECENT_EVENTS_PER_CONNECTION),
            },
        );
        state.by_user.entry(user_id).or_default().insert(connection_id);
        tracing::debug!(connection_id = %connection_id, user_id = %user_id, "连接已注册");
    }

    /// 移除连接，返回该用户在本实例上剩余的连接数
    pub async fn unregister(&self, connection_id: Uuid) -> Option<usize> {
        let mut state = self.state.write().await;
        let entry = state.connections.remove(&connection_id)?;

        for room_id in &entry.rooms {
            if let Some(members) = state.by_room.get_mut(room_id) {
                members.remove(&connection_id);
                if members.is_empty() {
                    state.by_room.remove(room_id);
                }
            }
        }

        let remaining = match state.by_user.get_mut(&entry.user_id) {
            Some(connections) => {
                connections.remove(&connection_id);
                connections.len()
            }
            None => 0,
        };
        if remaining == 0 {
            state.by_user.remove(&entry.user_id);
        }
        tracing::debug!(connection_id = %connection_id, user_id = %entry.user_id, remaining, "连接已注销");
        Some(remaining)
    }

    pub async fn join(&self, connection_id: Uuid, room_id: RoomId) {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let Some(entry) = state.connections.get_mut(&connection_id) else {
            return;
        };
        entry.rooms.insert(room_id);
        state.by_room.entry(room_id).or_default().insert(connection_id);
    }

    /// 把用户在本实例上的全部连接加入房间
    pub async fn join_user(&self, user_id: UserId, room_id: RoomId) {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let connections: Vec<Uuid> = state
            .by_user
            .get(&user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for connection_id in connections {
            if let Some(entry) = state.connections.get_mut(&connection_id) {
                entry.rooms.insert(room_id);
                state.by_room.entry(room_id).or_default().insert(connection_id);
            }
        }
    }

    pub async fn leave_user(&self, user_id: UserId, room_id: RoomId) {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let connections: Vec<Uuid> = state
            .by_user
            .get(&user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for connection_id in connections {
            if let Some(entry) = state.connections.get_mut(&connection_id) {
                entry.rooms.remove(&room_id);
            }
            if let Some(members) = state.by_room.get_mut(&room_id) {
                members.remove(&connection_id);
            }
        }
        if state.by_room.get(&room_id).is_some_and(HashSet::is_empty) {
            state.by_room.remove(&room_id);
        }
    }

    /// 直接写给某个连接（应答、错误、历史页、离线补发）
    pub async fn send_to(
        &self,
        connection_id: Uuid,
        event_id: Option<Uuid>,
        event: ServerEvent,
    ) -> bool {
        let mut state = self.state.write().await;
        match state.connections.get_mut(&connection_id) {
            Some(entry) => entry.push(event_id, event),
            None => false,
        }
    }

    /// 按信封的投递范围写给本地连接，返回实际收到事件的用户（去重后）
    pub async fn deliver(&self, envelope: &EventEnvelope) -> Vec<UserId> {
        let mut state = self.state.write().await;
        let targets: Vec<Uuid> = match envelope.audience {
            Audience::Room(room_id) => state
                .by_room
                .get(&room_id)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default(),
            Audience::User(user_id) => state
                .by_user
                .get(&user_id)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default(),
        };

        let mut reached = HashSet::new();
        for connection_id in targets {
            if let Some(entry) = state.connections.get_mut(&connection_id) {
                if entry.push(Some(envelope.event_id), envelope.event.clone()) {
                    reached.insert(entry.user_id);
                }
            }
        }
        reached.into_iter().collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    pub async fn user_connection_count(&self, user_id: UserId) -> usize {
        self.state
            .read()
            .await
            .by_user
            .get(&user_id)
            .map_or(0, HashSet::len)
    }

    pub async fn rooms_of(&self, connection_id: Uuid) -> Vec<RoomId> {
        self.state
            .read()
            .await
            .connections
            .get(&connection_id)
            .map(|entry| entry.rooms.iter().copied().collect())
            .unwrap_or_default()
    }
}
