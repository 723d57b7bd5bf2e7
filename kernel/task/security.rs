//! Trust tokens
//!
//! Every process and thread carries a globally unique 64-bit token.
//! Tokens map to a bitmask trust level; a syscall handler names the
//! mask it requires and the dispatcher checks the intersection.

use alloc::vec::Vec;

use bitflags::bitflags;
use spin::Mutex;

use crate::printkln;
use crate::random;

bitflags! {
    /// Trust level bitmask
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TrustLevel: u32 {
        const TRUSTED_BY_KERNEL = 1;
        const TRUSTED = 2;
        const UNTRUSTED = 4;
        const UNKNOWN = 8;
    }
}

impl TrustLevel {
    /// The level granted to init and kernel-side threads
    pub const FULL_TRUST: TrustLevel = TrustLevel::TRUSTED_BY_KERNEL.union(TrustLevel::TRUSTED);
}

/// One registered token
struct TokenEntry {
    token: u64,
    level: TrustLevel,
}

/// Process-wide token registry
pub struct SecurityManager {
    tokens: Mutex<Vec<TokenEntry>>,
}

impl SecurityManager {
    /// Empty registry
    pub const fn new() -> Self {
        Self {
            tokens: Mutex::new(Vec::new()),
        }
    }

    /// Draw a fresh unique token at `UNKNOWN` trust
    pub fn create_token(&self) -> u64 {
        let mut tokens = self.tokens.lock();
        loop {
            let candidate = random::rand64();
            if tokens.iter().any(|t| t.token == candidate) {
                continue;
            }
            tokens.push(TokenEntry {
                token: candidate,
                level: TrustLevel::UNKNOWN,
            });
            return candidate;
        }
    }

    /// Replace a token's trust level
    pub fn trust_token(&self, token: u64, level: TrustLevel) -> bool {
        let mut tokens = self.tokens.lock();
        match tokens.iter_mut().find(|t| t.token == token) {
            Some(entry) => {
                entry.level = level;
                true
            }
            None => {
                printkln!("security: failed to trust token {:#x}", token);
                false
            }
        }
    }

    /// Drop a token to `UNTRUSTED`
    pub fn untrust_token(&self, token: u64) -> bool {
        self.trust_token(token, TrustLevel::UNTRUSTED)
    }

    /// OR extra bits into a token's level
    pub fn add_trust_level(&self, token: u64, level: TrustLevel) -> bool {
        let mut tokens = self.tokens.lock();
        match tokens.iter_mut().find(|t| t.token == token) {
            Some(entry) => {
                entry.level |= level;
                true
            }
            None => {
                printkln!("security: failed to add trust to token {:#x}", token);
                false
            }
        }
    }

    /// Clear bits out of a token's level
    pub fn remove_trust_level(&self, token: u64, level: TrustLevel) -> bool {
        let mut tokens = self.tokens.lock();
        match tokens.iter_mut().find(|t| t.token == token) {
            Some(entry) => {
                entry.level &= !level;
                true
            }
            None => {
                printkln!("security: failed to remove trust from token {:#x}", token);
                false
            }
        }
    }

    /// Whether the token's level intersects `required`
    pub fn is_token_trusted(&self, token: u64, required: TrustLevel) -> bool {
        let tokens = self.tokens.lock();
        match tokens.iter().find(|t| t.token == token) {
            Some(entry) => entry.level.intersects(required),
            None => {
                printkln!("security: trust check on unknown token {:#x}", token);
                false
            }
        }
    }

    /// A token's current level
    pub fn get_token_trust_level(&self, token: u64) -> TrustLevel {
        let tokens = self.tokens.lock();
        tokens
            .iter()
            .find(|t| t.token == token)
            .map(|t| t.level)
            .unwrap_or(TrustLevel::UNKNOWN)
    }

    /// Forget a token
    pub fn destroy_token(&self, token: u64) -> bool {
        let mut tokens = self.tokens.lock();
        match tokens.iter().position(|t| t.token == token) {
            Some(pos) => {
                tokens.remove(pos);
                true
            }
            None => false,
        }
    }
}

impl Default for SecurityManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_token_is_unknown() {
        let security = SecurityManager::new();
        let token = security.create_token();
        assert_eq!(security.get_token_trust_level(token), TrustLevel::UNKNOWN);
        assert!(security.is_token_trusted(token, TrustLevel::UNKNOWN));
        assert!(!security.is_token_trusted(token, TrustLevel::TRUSTED));
    }

    #[test]
    fn test_trust_monotonicity() {
        let security = SecurityManager::new();
        let token = security.create_token();

        assert!(security.add_trust_level(token, TrustLevel::TRUSTED));
        assert!(security.is_token_trusted(token, TrustLevel::TRUSTED));

        assert!(security.remove_trust_level(token, TrustLevel::TRUSTED));
        assert!(!security.is_token_trusted(token, TrustLevel::TRUSTED));
    }

    #[test]
    fn test_mask_intersection() {
        let security = SecurityManager::new();
        let token = security.create_token();
        security.trust_token(token, TrustLevel::FULL_TRUST);

        // Any overlapping bit satisfies the requirement
        assert!(security.is_token_trusted(token, TrustLevel::TRUSTED));
        assert!(security.is_token_trusted(token, TrustLevel::TRUSTED_BY_KERNEL));
        assert!(security.is_token_trusted(
            token,
            TrustLevel::TRUSTED | TrustLevel::UNTRUSTED
        ));
        assert!(!security.is_token_trusted(token, TrustLevel::UNTRUSTED));
    }

    #[test]
    fn test_untrust_and_destroy() {
        let security = SecurityManager::new();
        let token = security.create_token();
        security.trust_token(token, TrustLevel::FULL_TRUST);

        security.untrust_token(token);
        assert_eq!(security.get_token_trust_level(token), TrustLevel::UNTRUSTED);

        assert!(security.destroy_token(token));
        assert!(!security.destroy_token(token));
        assert!(!security.is_token_trusted(token, TrustLevel::UNTRUSTED));
    }

    #[test]
    fn test_tokens_unique() {
        let security = SecurityManager::new();
        let a = security.create_token();
        let b = security.create_token();
        assert_ne!(a, b);
    }
}
