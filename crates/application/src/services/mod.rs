mod directory_service;
mod message_service;

pub use directory_service::{CreateGroupRequest, DirectoryService, DirectoryServiceDependencies};
pub use message_service::{
    CreateMessageRequest, HistoryQuery, MessagePage, MessageService, MessageServiceDependencies,
    ReadOutcome,
};
