use std::collections::BTreeSet;
use std::sync::Arc;

use domain::{MemberRole, Membership, MessageId, Room, RoomId, UserId};

use crate::{clock::Clock, error::ApplicationError, repository::RoomRepository};

#[derive(Debug, Clone)]
pub struct CreateGroupRequest {
    pub creator: UserId,
    pub member_ids: Vec<UserId>,
    pub name: Option<String>,
    pub is_private: bool,
}

pub struct DirectoryServiceDependencies {
    pub room_repository: Arc<dyn RoomRepository>,
    pub clock: Arc<dyn Clock>,
}

/// 房间与成员关系目录
pub struct DirectoryService {
    deps: DirectoryServiceDependencies,
}

impl DirectoryService {
    pub fn new(deps: DirectoryServiceDependencies) -> Self {
        Self { deps }
    }

    /// 幂等：同一对用户无论参数顺序都落到同一个房间。返回值第二项表示是否新建。
    pub async fn create_direct(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<(Room, bool), ApplicationError> {
        let now = self.deps.clock.now();
        let room = Room::new_direct(a, b, now)?;
        let members = vec![
            Membership::new(room.id, a, MemberRole::Member, now),
            Membership::new(room.id, b, MemberRole::Member, now),
        ];
        let (room, created) = self
            .deps
            .room_repository
            .create_if_absent(room, members)
            .await?;
        if created {
            tracing::info!(room_id = %room.id, "单聊房间已创建");
        }
        Ok((room, created))
    }

    /// 创建者成为管理员，其余成员去重后以普通成员加入。返回房间与全部成员 ID。
    pub async fn create_group(
        &self,
        request: CreateGroupRequest,
    ) -> Result<(Room, Vec<UserId>), ApplicationError> {
        let now = self.deps.clock.now();
        let room = Room::new_group(request.creator, request.name, request.is_private, now)?;

        let mut member_ids = vec![request.creator];
        let mut seen = BTreeSet::from([request.creator]);
        for user_id in request.member_ids {
            if seen.insert(user_id) {
                member_ids.push(user_id);
            }
        }

        let members = member_ids
            .iter()
            .map(|user_id| {
                let role = if *user_id == request.creator {
                    MemberRole::Admin
                } else {
                    MemberRole::Member
                };
                Membership::new(room.id, *user_id, role, now)
            })
            .collect();

        let (room, _) = self
            .deps
            .room_repository
            .create_if_absent(room, members)
            .await?;
        tracing::info!(room_id = %room.id, members = member_ids.len(), "群聊房间已创建");
        Ok((room, member_ids))
    }

    pub async fn find_room(&self, room_id: RoomId) -> Result<Room, ApplicationError> {
        self.deps
            .room_repository
            .find_by_id(room_id)
            .await?
            .filter(|room| !room.is_deleted())
            .ok_or_else(|| ApplicationError::not_found("room", room_id))
    }

    pub async fn is_member(&self, room_id: RoomId, user_id: UserId) -> Result<bool, ApplicationError> {
        Ok(self
            .deps
            .room_repository
            .find_member(room_id, user_id)
            .await?
            .is_some_and(|member| member.is_active()))
    }

    /// 房间不存在返回 NotFound，不是活跃成员返回 NotAMember。
    pub async fn require_member(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<Membership, ApplicationError> {
        self.find_room(room_id).await?;
        self.deps
            .room_repository
            .find_member(room_id, user_id)
            .await?
            .filter(|member| member.is_active())
            .ok_or(ApplicationError::NotAMember { room_id, user_id })
    }

    pub async fn list_rooms_for(&self, user_id: UserId) -> Result<Vec<Room>, ApplicationError> {
        Ok(self.deps.room_repository.list_rooms_for(user_id).await?)
    }

    pub async fn list_members(&self, room_id: RoomId) -> Result<Vec<Membership>, ApplicationError> {
        Ok(self.deps.room_repository.list_members(room_id).await?)
    }

    /// 仍在房间里的成员，离开的成员不再接收广播
    pub async fn active_member_ids(&self, room_id: RoomId) -> Result<Vec<UserId>, ApplicationError> {
        Ok(self
            .list_members(room_id)
            .await?
            .into_iter()
            .filter(Membership::is_active)
            .map(|member| member.user_id)
            .collect())
    }

    /// 与该用户共享至少一个房间的其他用户
    pub async fn contacts_of(&self, user_id: UserId) -> Result<Vec<UserId>, ApplicationError> {
        let mut contacts = BTreeSet::new();
        for room in self.list_rooms_for(user_id).await? {
            contacts.extend(self.active_member_ids(room.id).await?);
        }
        contacts.remove(&user_id);
        Ok(contacts.into_iter().collect())
    }

    pub async fn update_last_read(
        &self,
        room_id: RoomId,
        user_id: UserId,
        message_id: MessageId,
    ) -> Result<(), ApplicationError> {
        let now = self.deps.clock.now();
        self.deps
            .room_repository
            .update_last_read(room_id, user_id, message_id, now)
            .await?;
        Ok(())
    }

    /// member/admin → left。单聊房间不能离开；群里仍有其他成员时，唯一的管理员不能离开。
    pub async fn leave_room(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<Membership, ApplicationError> {
        let room = self.find_room(room_id).await?;
        if room.is_direct() {
            return Err(ApplicationError::validation("direct rooms cannot be left"));
        }
        let mut member = self.require_member(room_id, user_id).await?;
        if member.is_admin() {
            let members = self.list_members(room_id).await?;
            let other_admins = members
                .iter()
                .filter(|m| m.user_id != user_id && m.is_admin())
                .count();
            let others_remaining = members
                .iter()
                .any(|m| m.user_id != user_id && m.is_active());
            // 房间里还有人时不能留下一个没有管理员的群
            if other_admins == 0 && others_remaining {
                return Err(ApplicationError::validation(
                    "the last admin must promote another member before leaving",
                ));
            }
        }
        member.leave(self.deps.clock.now())?;
        let member = self.deps.room_repository.upsert_member(member).await?;
        tracing::info!(room_id = %room_id, user_id = %user_id, "成员已离开房间");
        Ok(member)
    }

    /// 只有现任管理员可以提升或降级成员；最后一个管理员不能降级自己。
    pub async fn set_member_role(
        &self,
        room_id: RoomId,
        actor: UserId,
        target: UserId,
        role: MemberRole,
    ) -> Result<Membership, ApplicationError> {
        let room = self.find_room(room_id).await?;
        if room.is_direct() {
            return Err(ApplicationError::validation("direct rooms have no roles"));
        }
        let actor_member = self.require_member(room_id, actor).await?;
        if !actor_member.is_admin() {
            return Err(ApplicationError::Unauthorized(
                "only room admins can change roles".into(),
            ));
        }

        let mut member = self
            .deps
            .room_repository
            .find_member(room_id, target)
            .await?
            .filter(|member| member.is_active())
            .ok_or(ApplicationError::NotAMember {
                room_id,
                user_id: target,
            })?;

        if member.is_admin() && role == MemberRole::Member {
            let admins = self
                .list_members(room_id)
                .await?
                .iter()
                .filter(|m| m.is_admin())
                .count();
            if admins <= 1 {
                return Err(ApplicationError::validation(
                    "a room must keep at least one admin",
                ));
            }
        }

        member.change_role(role)?;
        let member = self.deps.room_repository.upsert_member(member).await?;
        tracing::info!(room_id = %room_id, user_id = %target, role = role.as_str(), "成员角色已更新");
        Ok(member)
    }
}
