use async_trait::async_trait;
use crate::core::{Authorizer, Result, UploadError};
use super::credential::Credential;

/// Headless authorizer handing out a pre-provisioned access token.
///
/// Used when consent happened out of band (for example a token minted by
/// another tool). It cannot refresh, so an expired token falls through to
/// `authorize`, which returns the configured token again.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredTokenAuthorizer {
    access_token: Option<String>,
}

impl ConfiguredTokenAuthorizer {
    pub fn new(access_token: Option<String>) -> Self {
        Self {
            access_token: access_token.filter(|token| !token.trim().is_empty()),
        }
    }
}

#[async_trait]
impl Authorizer for ConfiguredTokenAuthorizer {
    async fn authorize(&self, scopes: &[String]) -> Result<Credential> {
        match &self.access_token {
            Some(token) => Ok(Credential::new(token.clone()).with_scopes(scopes.to_vec())),
            None => Err(UploadError::auth(
                "no stored credential and no access token configured (set api.access_token)",
            )),
        }
    }

    async fn refresh(&self, _credential: &Credential) -> Result<Credential> {
        Err(UploadError::auth("configured tokens cannot be refreshed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;

    #[tokio::test]
    async fn hands_out_configured_token() {
        let authorizer = ConfiguredTokenAuthorizer::new(Some("tok".to_string()));
        let cred = authorizer.authorize(&["scope".to_string()]).await.unwrap();
        assert_eq!(cred.access_token, "tok");
        assert_eq!(cred.scopes, vec!["scope".to_string()]);
        assert_eq!(authorizer.refresh(&cred).await.unwrap_err().kind(), ErrorKind::Authentication);
    }

    #[tokio::test]
    async fn blank_token_fails_authorization() {
        let authorizer = ConfiguredTokenAuthorizer::new(Some("  ".to_string()));
        let err = authorizer.authorize(&[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }
}
