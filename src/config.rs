//! Configuration for identity-vault
//!
//! CLI arguments and environment variable handling using clap. A `.env` file
//! is loaded by the binary before parsing.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use clap::{Parser, Subcommand, ValueEnum};
use zeroize::Zeroizing;

use crate::crypto::{KeyRing, KEY_LEN};
use crate::db::SqliteStoreConfig;
use crate::error::IdentityError;
use crate::types::KeyId;

/// identity-vault - pseudonymous user ids and sealed contact attributes
#[derive(Parser, Clone)]
#[command(name = "identity-vault")]
#[command(about = "Resolve messaging identities to user ids and protect their attributes at rest")]
pub struct Args {
    /// SQLite database file
    #[arg(long, env = "DATABASE_PATH", default_value = "identity-vault.db")]
    pub database_path: PathBuf,

    /// Maximum pooled database connections
    #[arg(long, env = "DB_POOL_SIZE", default_value = "8")]
    pub db_pool_size: u32,

    /// Transaction timeout in milliseconds (0 disables the bound)
    #[arg(long, env = "TX_TIMEOUT_MS", default_value = "5000")]
    pub tx_timeout_ms: u64,

    /// Identity hashing key (raw, or prefixed with `hex:` / `base64:`)
    #[arg(long, env = "HMAC_KEY", hide_env_values = true)]
    pub hmac_key: Option<String>,

    /// Key id stored next to every identity hash
    #[arg(long, env = "HMAC_KEY_ID", default_value = "1")]
    pub hmac_key_id: i16,

    /// 32-byte attribute encryption key (raw, or prefixed with `hex:` / `base64:`)
    #[arg(long, env = "AEAD_KEY", hide_env_values = true)]
    pub aead_key: Option<String>,

    /// Key id stored next to every sealed attribute
    #[arg(long, env = "AEAD_KEY_ID", default_value = "1")]
    pub aead_key_id: i16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Create or upgrade the database schema
    Migrate,

    /// Resolve an external identity to its user id
    Resolve {
        /// Messaging platform, e.g. telegram
        #[arg(long)]
        transport: String,

        /// Platform-specific user identifier
        #[arg(long)]
        external_id: String,

        /// Chat id to seal for the user in the same transaction
        #[arg(long)]
        chat_id: Option<i64>,
    },

    /// Decrypt and print the stored chat id of a user
    Reveal {
        #[arg(long)]
        user_id: i64,

        /// Transport whose name was bound into the box
        #[arg(long)]
        transport: String,
    },

    /// Show key ids and row counts
    Status,

    /// Seal, open and tamper-check a box with the configured key
    Selftest,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.db_pool_size == 0 {
            return Err("DB_POOL_SIZE must be at least 1".to_string());
        }

        match self.command {
            Command::Migrate => Ok(()),
            Command::Selftest => self.aead_key_bytes().map(|_| ()),
            _ => {
                self.hmac_key_bytes()?;
                self.aead_key_bytes()?;
                Ok(())
            }
        }
    }

    pub fn hmac_key_bytes(&self) -> Result<Zeroizing<Vec<u8>>, String> {
        let raw = self
            .hmac_key
            .as_deref()
            .ok_or_else(|| "HMAC_KEY is required".to_string())?;
        let key = decode_key(raw).map_err(|e| format!("HMAC_KEY: {}", e))?;
        if key.is_empty() {
            return Err("HMAC_KEY must not be empty".to_string());
        }
        Ok(key)
    }

    pub fn aead_key_bytes(&self) -> Result<Zeroizing<Vec<u8>>, String> {
        let raw = self
            .aead_key
            .as_deref()
            .ok_or_else(|| "AEAD_KEY is required".to_string())?;
        let key = decode_key(raw).map_err(|e| format!("AEAD_KEY: {}", e))?;
        if key.len() != KEY_LEN {
            return Err(format!(
                "AEAD_KEY must be {} bytes, got {}",
                KEY_LEN,
                key.len()
            ));
        }
        Ok(key)
    }

    /// Build a ring holding the configured key pair.
    pub fn key_ring(&self) -> Result<KeyRing, IdentityError> {
        let hash_key = self
            .hmac_key_bytes()
            .map_err(|e| IdentityError::configuration("configure_keys", e))?;
        let enc_key = self
            .aead_key_bytes()
            .map_err(|e| IdentityError::configuration("configure_keys", e))?;

        KeyRing::with_keys(
            &hash_key,
            KeyId(self.hmac_key_id),
            &enc_key,
            KeyId(self.aead_key_id),
        )
        .map_err(|e| IdentityError::from_crypto("configure_keys", e))
    }

    /// `None` when transactions are unbounded.
    pub fn tx_timeout(&self) -> Option<Duration> {
        (self.tx_timeout_ms > 0).then(|| Duration::from_millis(self.tx_timeout_ms))
    }

    pub fn store_config(&self) -> SqliteStoreConfig {
        let mut config = SqliteStoreConfig::new(&self.database_path);
        config.pool_size = self.db_pool_size;
        if let Some(timeout) = self.tx_timeout() {
            config.busy_timeout = timeout;
        }
        config
    }
}

impl fmt::Debug for Args {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted = |key: &Option<String>| key.as_ref().map(|_| "<redacted>");
        f.debug_struct("Args")
            .field("database_path", &self.database_path)
            .field("db_pool_size", &self.db_pool_size)
            .field("tx_timeout_ms", &self.tx_timeout_ms)
            .field("hmac_key", &redacted(&self.hmac_key))
            .field("hmac_key_id", &self.hmac_key_id)
            .field("aead_key", &redacted(&self.aead_key))
            .field("aead_key_id", &self.aead_key_id)
            .field("log_level", &self.log_level)
            .field("log_format", &self.log_format)
            .field("command", &self.command)
            .finish()
    }
}

/// Decode key material written as raw text, `hex:...` or `base64:...`.
pub fn decode_key(value: &str) -> Result<Zeroizing<Vec<u8>>, String> {
    let bytes = if let Some(hex_value) = value.strip_prefix("hex:") {
        hex::decode(hex_value.trim()).map_err(|e| format!("invalid hex: {}", e))?
    } else if let Some(b64_value) = value.strip_prefix("base64:") {
        base64::engine::general_purpose::STANDARD
            .decode(b64_value.trim())
            .map_err(|e| format!("invalid base64: {}", e))?
    } else {
        value.as_bytes().to_vec()
    };
    Ok(Zeroizing::new(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    const AEAD_HEX: &str = "hex:000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["identity-vault"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_decode_key_forms() {
        assert_eq!(decode_key("abc").unwrap().as_slice(), b"abc");
        assert_eq!(decode_key("hex:00ff").unwrap().as_slice(), &[0x00, 0xff]);
        assert_eq!(decode_key("base64:AAE=").unwrap().as_slice(), &[0x00, 0x01]);
        assert!(decode_key("hex:zz").is_err());
        assert!(decode_key("base64:***").is_err());
    }

    #[test]
    fn test_key_ring_from_args() {
        let args = parse(&[
            "--hmac-key",
            "secret",
            "--aead-key",
            AEAD_HEX,
            "--aead-key-id",
            "3",
            "status",
        ]);
        assert!(args.validate().is_ok());

        let ring = args.key_ring().unwrap();
        assert_eq!(ring.hash_key_id(), Some(KeyId(1)));
        assert_eq!(ring.enc_key_id(), Some(KeyId(3)));
    }

    #[test]
    fn test_short_aead_key_rejected() {
        let args = parse(&["--hmac-key", "secret", "--aead-key", "hex:0011", "status"]);
        let err = args.validate().unwrap_err();
        assert!(err.contains("32 bytes"), "{}", err);
        assert!(matches!(
            args.key_ring(),
            Err(IdentityError::Configuration { .. })
        ));
    }

    #[test]
    fn test_migrate_needs_no_keys() {
        let args = parse(&["migrate"]);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_timeouts() {
        let args = parse(&["--tx-timeout-ms", "250", "migrate"]);
        assert_eq!(args.tx_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(args.store_config().busy_timeout, Duration::from_millis(250));

        let unbounded = parse(&["--tx-timeout-ms", "0", "migrate"]);
        assert_eq!(unbounded.tx_timeout(), None);
    }

    #[test]
    fn test_debug_redacts_keys() {
        let args = parse(&["--hmac-key", "super-secret", "--aead-key", AEAD_HEX, "status"]);
        let rendered = format!("{:?}", args);
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("0a0b0c"));
    }

    #[test]
    fn test_resolve_command() {
        let args = parse(&[
            "resolve",
            "--transport",
            "telegram",
            "--external-id",
            "1001",
            "--chat-id",
            "555555",
        ]);
        assert_eq!(
            args.command,
            Command::Resolve {
                transport: "telegram".into(),
                external_id: "1001".into(),
                chat_id: Some(555555),
            }
        );
    }
}
