use microman_core::Session;
use microman_worker::{HandlerContext, HandlerError, HandlerResult};
use regex::Regex;
use serde::Deserialize;
use serde_json::json;

use super::validate_len;
use crate::auth::TokenSigner;

#[derive(Debug, Deserialize)]
struct SignupRequest {
    email: String,
    password: String,
}

const EMAIL_PATTERN: &str = r"^[^@\s]+@[^@\s]+\.[^@\s]+$";

/// Normalized email, or an error naming the field
pub fn validate_email(raw: &str) -> Result<String, HandlerError> {
    let email = raw.trim().to_lowercase();
    validate_len("email", &email, 2, 128)?;
    let pattern = Regex::new(EMAIL_PATTERN).map_err(|e| HandlerError::msg(e.to_string()))?;
    if !pattern.is_match(&email) {
        return Err(HandlerError::InvalidPayload(
            "\"email\" must be a valid email".to_string(),
        ));
    }
    Ok(email)
}

/// Create a user and attach its session to the calling connection
pub async fn signup(ctx: HandlerContext, signer: &TokenSigner) -> HandlerResult {
    let request: SignupRequest = ctx.payload_as()?;
    let email = validate_email(&request.email)?;
    validate_len("password", request.password.trim(), 8, 128)?;

    let user_id = uuid::Uuid::new_v4().simple().to_string();
    let session = Session::new(user_id.clone(), email.clone());
    let access_token = signer
        .create(&session)
        .map_err(|e| HandlerError::msg(e.to_string()))?;

    ctx.reply_with(
        "signup",
        json!({
            "user": { "_id": user_id, "email": email },
            "accessToken": access_token,
        }),
        ctx.meta.clone(),
        Some(session),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_email() {
        assert_eq!(validate_email(" Ace@Base.se ").unwrap(), "ace@base.se");
        assert!(validate_email("not-an-email").is_err());
        assert!(validate_email("a@b").is_err());
    }
}
