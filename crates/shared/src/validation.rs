//! Send-request validation shared by the gateway and clients

use crate::error::ValidationError;
use crate::types::{AttachmentDescriptor, IdentityId};

/// Size limits applied to inbound messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageLimits {
    pub max_body_chars: usize,
    pub max_token_chars: usize,
}

impl Default for MessageLimits {
    fn default() -> Self {
        Self {
            max_body_chars: 4000,
            max_token_chars: 64,
        }
    }
}

impl MessageLimits {
    /// Validate a private send. Returns the trimmed body, `None` when blank.
    pub fn check_private(
        &self,
        receiver_id: IdentityId,
        body: Option<&str>,
        attachment: Option<&AttachmentDescriptor>,
        idempotency_token: &str,
    ) -> Result<Option<String>, ValidationError> {
        if receiver_id <= 0 {
            return Err(ValidationError::InvalidReceiver(receiver_id));
        }
        self.check_token(idempotency_token)?;

        let body = self.check_body(body)?;
        if let Some(attachment) = attachment {
            check_attachment(attachment)?;
        }
        if body.is_none() && attachment.is_none() {
            return Err(ValidationError::EmptyMessage);
        }

        Ok(body)
    }

    /// Validate a global send. Global messages always carry a body.
    pub fn check_global(&self, body: &str) -> Result<String, ValidationError> {
        self.check_body(Some(body))?
            .ok_or(ValidationError::EmptyMessage)
    }

    fn check_body(&self, body: Option<&str>) -> Result<Option<String>, ValidationError> {
        let Some(body) = body.map(str::trim).filter(|b| !b.is_empty()) else {
            return Ok(None);
        };
        if body.chars().count() > self.max_body_chars {
            return Err(ValidationError::BodyTooLong {
                max: self.max_body_chars,
            });
        }
        Ok(Some(body.to_string()))
    }

    fn check_token(&self, token: &str) -> Result<(), ValidationError> {
        if token.trim().is_empty() {
            return Err(ValidationError::MissingToken);
        }
        if token.chars().count() > self.max_token_chars {
            return Err(ValidationError::TokenTooLong {
                max: self.max_token_chars,
            });
        }
        Ok(())
    }
}

fn check_attachment(attachment: &AttachmentDescriptor) -> Result<(), ValidationError> {
    if attachment.storage_key.is_empty() {
        return Err(ValidationError::InvalidAttachment("missing storage key"));
    }
    if attachment.file_name.trim().is_empty() {
        return Err(ValidationError::InvalidAttachment("missing file name"));
    }
    if attachment.storage_key.starts_with('/')
        || attachment.storage_key.split(['/', '\\']).any(|part| part == "..")
    {
        return Err(ValidationError::InvalidAttachment("storage key escapes upload root"));
    }
    if attachment.size_bytes < 0 {
        return Err(ValidationError::InvalidAttachment("negative size"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(key: &str) -> AttachmentDescriptor {
        AttachmentDescriptor {
            storage_key: key.to_string(),
            file_name: "photo.png".to_string(),
            mime_type: "image/png".to_string(),
            size_bytes: 1024,
        }
    }

    #[test]
    fn test_body_or_attachment_required() {
        let limits = MessageLimits::default();
        assert_eq!(
            limits.check_private(2, None, None, "t1"),
            Err(ValidationError::EmptyMessage)
        );
        assert_eq!(
            limits.check_private(2, Some("   "), None, "t1"),
            Err(ValidationError::EmptyMessage)
        );
        assert_eq!(
            limits.check_private(2, None, Some(&attachment("a/b.png")), "t1"),
            Ok(None)
        );
        assert_eq!(
            limits.check_private(2, Some(" hi "), None, "t1"),
            Ok(Some("hi".to_string()))
        );
    }

    #[test]
    fn test_receiver_and_token_rules() {
        let limits = MessageLimits::default();
        assert_eq!(
            limits.check_private(0, Some("hi"), None, "t1"),
            Err(ValidationError::InvalidReceiver(0))
        );
        assert_eq!(
            limits.check_private(2, Some("hi"), None, ""),
            Err(ValidationError::MissingToken)
        );
        let long_token = "x".repeat(65);
        assert_eq!(
            limits.check_private(2, Some("hi"), None, &long_token),
            Err(ValidationError::TokenTooLong { max: 64 })
        );
    }

    #[test]
    fn test_body_limit_counts_chars() {
        let limits = MessageLimits {
            max_body_chars: 3,
            max_token_chars: 64,
        };
        assert!(limits.check_global("héé").is_ok());
        assert_eq!(
            limits.check_global("four"),
            Err(ValidationError::BodyTooLong { max: 3 })
        );
        assert_eq!(limits.check_global(" "), Err(ValidationError::EmptyMessage));
    }

    #[test]
    fn test_attachment_path_traversal_rejected() {
        let limits = MessageLimits::default();
        for key in ["../etc/passwd", "/abs/path", "a/../../b"] {
            assert!(matches!(
                limits.check_private(2, None, Some(&attachment(key)), "t1"),
                Err(ValidationError::InvalidAttachment(_))
            ));
        }
    }
}
