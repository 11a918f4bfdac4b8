use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::Rng;
use rand::rngs::OsRng;
use ulid::Ulid;

use crate::limits::{MAX_OTP_ATTEMPTS, OTP_DIGITS};
use crate::model::{IssuedCode, Ms, Phase};
use crate::observability;

#[derive(Debug, Clone)]
struct Challenge {
    code: String,
    expires_at: Ms,
    failed_attempts: u8,
}

/// Outcome of checking a candidate code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeCheck {
    Accepted,
    Missing,
    Expired,
    Mismatch,
    /// Mismatch that used up the last allowed attempt; the challenge is gone.
    Exhausted,
}

impl CodeCheck {
    pub fn accepted(&self) -> bool {
        matches!(self, CodeCheck::Accepted)
    }

    pub fn label(&self) -> &'static str {
        match self {
            CodeCheck::Accepted => "accepted",
            CodeCheck::Missing => "missing",
            CodeCheck::Expired => "expired",
            CodeCheck::Mismatch => "mismatch",
            CodeCheck::Exhausted => "exhausted",
        }
    }
}

/// Live handover challenges keyed by `(reservation, phase)`.
///
/// Held only in memory. Issue and verify go through the map's entry API, so
/// each key is updated under its shard lock and a code can be redeemed once.
pub struct OtpStore {
    challenges: DashMap<(Ulid, Phase), Challenge>,
    ttl_ms: Ms,
    capacity: usize,
}

impl OtpStore {
    pub fn new(ttl_ms: Ms, capacity: usize) -> Self {
        Self {
            challenges: DashMap::new(),
            ttl_ms,
            capacity: capacity.max(1),
        }
    }

    pub fn ttl_ms(&self) -> Ms {
        self.ttl_ms
    }

    pub fn len(&self) -> usize {
        self.challenges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.challenges.is_empty()
    }

    /// Issue a fresh code, replacing any live challenge for the same key.
    pub fn issue(&self, reservation_id: Ulid, phase: Phase, now: Ms) -> IssuedCode {
        let key = (reservation_id, phase);
        if !self.challenges.contains_key(&key) && self.challenges.len() >= self.capacity {
            self.make_room(now);
        }

        let code = generate_code();
        let expires_at = now + self.ttl_ms;
        self.challenges.insert(
            key,
            Challenge {
                code: code.clone(),
                expires_at,
                failed_attempts: 0,
            },
        );
        metrics::counter!(observability::OTP_ISSUED_TOTAL, "phase" => phase.as_str()).increment(1);
        metrics::gauge!(observability::OTP_LIVE_CHALLENGES).set(self.challenges.len() as f64);

        IssuedCode {
            reservation_id,
            phase,
            code,
            expires_at,
        }
    }

    /// Check `candidate` against the live challenge and consume it on a match.
    pub fn verify(&self, reservation_id: Ulid, phase: Phase, candidate: &str, now: Ms) -> CodeCheck {
        match self.redeem(reservation_id, phase, candidate, now) {
            Ok(redemption) => {
                redemption.commit();
                CodeCheck::Accepted
            }
            Err(check) => check,
        }
    }

    /// Take the live challenge out if `candidate` matches it.
    ///
    /// Expired challenges are purged on sight. A wrong code leaves the
    /// challenge in place until it has been guessed at `MAX_OTP_ATTEMPTS`
    /// times. A correct code before expiry comes back as a [`Redemption`] that
    /// must be committed, otherwise the challenge is put back.
    pub fn redeem(
        &self,
        reservation_id: Ulid,
        phase: Phase,
        candidate: &str,
        now: Ms,
    ) -> Result<Redemption<'_>, CodeCheck> {
        let outcome = match self.challenges.entry((reservation_id, phase)) {
            Entry::Vacant(_) => Err(CodeCheck::Missing),
            Entry::Occupied(mut entry) => {
                if now > entry.get().expires_at {
                    entry.remove();
                    Err(CodeCheck::Expired)
                } else if codes_match(&entry.get().code, candidate) {
                    let (key, challenge) = entry.remove_entry();
                    Ok(Redemption {
                        store: self,
                        key,
                        challenge: Some(challenge),
                    })
                } else {
                    let challenge = entry.get_mut();
                    challenge.failed_attempts = challenge.failed_attempts.saturating_add(1);
                    if challenge.failed_attempts >= MAX_OTP_ATTEMPTS {
                        entry.remove();
                        Err(CodeCheck::Exhausted)
                    } else {
                        Err(CodeCheck::Mismatch)
                    }
                }
            }
        };
        let label = match &outcome {
            Ok(_) => CodeCheck::Accepted.label(),
            Err(check) => check.label(),
        };
        metrics::counter!(observability::OTP_VERIFICATIONS_TOTAL, "outcome" => label).increment(1);
        metrics::gauge!(observability::OTP_LIVE_CHALLENGES).set(self.challenges.len() as f64);
        outcome
    }

    pub fn clear(&self, reservation_id: Ulid, phase: Phase) {
        self.challenges.remove(&(reservation_id, phase));
    }

    /// Drop every challenge belonging to a reservation.
    pub fn clear_reservation(&self, reservation_id: Ulid) {
        self.clear(reservation_id, Phase::Pickup);
        self.clear(reservation_id, Phase::Return);
    }

    /// Remove expired challenges. Returns how many were dropped.
    pub fn sweep(&self, now: Ms) -> usize {
        let before = self.challenges.len();
        self.challenges.retain(|_, c| c.expires_at >= now);
        let removed = before.saturating_sub(self.challenges.len());
        if removed > 0 {
            metrics::counter!(observability::OTP_EVICTIONS_TOTAL, "cause" => "expired")
                .increment(removed as u64);
        }
        metrics::gauge!(observability::OTP_LIVE_CHALLENGES).set(self.challenges.len() as f64);
        removed
    }

    /// Sweep expired entries; if still full, drop the challenge closest to expiry.
    fn make_room(&self, now: Ms) {
        if self.sweep(now) > 0 && self.challenges.len() < self.capacity {
            return;
        }
        let victim = self
            .challenges
            .iter()
            .min_by_key(|e| e.value().expires_at)
            .map(|e| *e.key());
        if let Some(key) = victim {
            self.challenges.remove(&key);
            metrics::counter!(observability::OTP_EVICTIONS_TOTAL, "cause" => "capacity").increment(1);
            tracing::warn!(reservation = %key.0, phase = %key.1, "handover code store full, evicted oldest challenge");
        }
    }
}

/// A matched challenge held out of the store until the handover it gates is
/// durable. Dropping it uncommitted restores the challenge, unless a fresh
/// one was issued for the same key in the meantime.
pub struct Redemption<'a> {
    store: &'a OtpStore,
    key: (Ulid, Phase),
    challenge: Option<Challenge>,
}

impl Redemption<'_> {
    pub fn commit(mut self) {
        self.challenge = None;
    }
}

impl Drop for Redemption<'_> {
    fn drop(&mut self) {
        if let Some(challenge) = self.challenge.take() {
            self.store.challenges.entry(self.key).or_insert(challenge);
            metrics::gauge!(observability::OTP_LIVE_CHALLENGES)
                .set(self.store.challenges.len() as f64);
        }
    }
}

fn generate_code() -> String {
    let n: u32 = OsRng.gen_range(0..1_000_000);
    format!("{n:0width$}", width = OTP_DIGITS)
}

/// Compares every byte regardless of where the first difference is.
fn codes_match(expected: &str, candidate: &str) -> bool {
    let (a, b) = (expected.as_bytes(), candidate.trim().as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
