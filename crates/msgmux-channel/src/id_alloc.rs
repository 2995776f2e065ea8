//! Randomized message id allocation.
//!
//! Ids are drawn at random and probed against the set of open ids, so no
//! shared counter has to be coordinated between writer threads. The probe
//! count is bounded; exhausting it is reported to the caller as busy.

use rand::RngCore;

/// Candidates drawn before giving up.
pub const MAX_ALLOCATION_ATTEMPTS: usize = 50;

/// Mask applied to each candidate. Allocated ids are even and never `0xFFFF`.
pub const MESSAGE_ID_MASK: u16 = 0xFFFE;

/// Draw up to [`MAX_ALLOCATION_ATTEMPTS`] candidates and return the first
/// one for which `in_use` is false.
pub fn allocate_id<R, F>(rng: &mut R, mut in_use: F) -> Option<u16>
where
    R: RngCore + ?Sized,
    F: FnMut(u16) -> bool,
{
    (0..MAX_ALLOCATION_ATTEMPTS)
        .map(|_| rng.next_u32() as u16 & MESSAGE_ID_MASK)
        .find(|&id| !in_use(id))
}
