use async_trait::async_trait;
use domain::UserId;

use crate::error::ApplicationError;

/// 外部认证协作方：把凭证换成可信的用户身份。
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<UserId, ApplicationError>;
}
