//! Market-code generation.
//!
//! Codes are 8 letters drawn from a fixed alphabet and checked against the
//! store until an unused one turns up. Not a secret, just a short join code.

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{GameError, Result};
use crate::storage::EntityStore;

/// Letters a market code may contain.
pub const MARKET_ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMSOPQRSTUVXYZ";

/// Length of every market code.
pub const MARKET_ID_LEN: usize = 8;

/// Bounds the generate-and-test loop.
#[derive(Debug, Clone, Copy)]
pub struct IdPolicy {
    pub max_attempts: u32,
}

impl Default for IdPolicy {
    fn default() -> Self {
        Self { max_attempts: 1000 }
    }
}

/// Draw one candidate code.
pub fn random_market_id<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..MARKET_ID_LEN)
        .map(|_| MARKET_ID_ALPHABET[rng.gen_range(0..MARKET_ID_ALPHABET.len())] as char)
        .collect()
}

/// Whether `code` has the shape of a market code.
pub fn is_market_id(code: &str) -> bool {
    code.len() == MARKET_ID_LEN && code.bytes().all(|b| MARKET_ID_ALPHABET.contains(&b))
}

/// Pull candidates from `next_candidate` until one is absent from the store.
///
/// Gives up with [`GameError::IdSpaceExhausted`] after `policy.max_attempts`
/// collisions.
pub async fn new_unique_market_id<S, F>(
    store: &S,
    policy: &IdPolicy,
    mut next_candidate: F,
) -> Result<String>
where
    S: EntityStore + ?Sized,
    F: FnMut() -> String,
{
    for attempt in 1..=policy.max_attempts {
        let candidate = next_candidate();
        if !store.market_exists(&candidate).await? {
            debug!(market_id = %candidate, attempt, "Market id allocated");
            return Ok(candidate);
        }
        debug!(market_id = %candidate, attempt, "Market id collision, retrying");
    }

    warn!(attempts = policy.max_attempts, "Market id space exhausted");
    Err(GameError::IdSpaceExhausted(policy.max_attempts))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
