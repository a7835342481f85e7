//! Reversible sandbox id <-> container name encoding.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use uuid::Uuid;

/// Env var the agent server reads its session API key from.
pub const SESSION_API_KEY_VARIABLE: &str = "OH_SESSION_API_KEYS_0";
pub const CREATED_BY_LABEL: &str = "created_by_user_id";
pub const SPEC_LABEL: &str = "sandbox_spec_id";

/// 32 random bytes from the OS RNG, URL-safe base64 without padding.
pub fn generate_session_api_key() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Debug, Clone)]
pub struct SandboxNaming {
    container_prefix: String,
    volume_prefix: String,
}

impl SandboxNaming {
    pub fn new(container_prefix: impl Into<String>, volume_prefix: impl Into<String>) -> Self {
        Self {
            container_prefix: container_prefix.into(),
            volume_prefix: volume_prefix.into(),
        }
    }

    pub fn container_prefix(&self) -> &str {
        &self.container_prefix
    }

    pub fn container_name(&self, id: Uuid) -> String {
        format!("{}{}", self.container_prefix, base62::encode(id.as_u128()))
    }

    pub fn sandbox_id(&self, container_name: &str) -> Option<Uuid> {
        let encoded = container_name.strip_prefix(&self.container_prefix)?;
        base62::decode(encoded).ok().map(Uuid::from_u128)
    }

    pub fn volume_name(&self, id: Uuid) -> String {
        format!("{}{}", self.volume_prefix, id)
    }
}
