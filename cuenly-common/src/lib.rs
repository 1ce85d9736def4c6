//! Types and functionality shared across the ingestion pipeline crates:
//! the data model, the error taxonomy, config/env helpers, and small
//! serde/byte-handling utilities.

// `proptest_derive::Arbitrary` issue. This will hard-error for edition 2024 so
// hopefully it gets fixed soon...
// See: <https://github.com/proptest-rs/proptest/issues/447>
#![allow(non_local_definitions)]

/// serde_with helper for base64-encoded bytes types.
pub mod base64_or_bytes;
/// `base64_or_bytes` but for [`Option`] bytes types.
pub mod base64_or_bytes_opt;
/// Exponential backoff.
pub mod backoff;
/// [`dotenvy`] extensions.
pub mod dotenv;
/// Validated `DEPLOY_ENVIRONMENT` / process configuration.
pub mod env;
/// The ingestion error taxonomy (§7).
pub mod error;
/// Hex utils.
pub mod hex;
/// Iterator extensions.
pub mod iter;
/// The shared data model (§3): invoices, emails, subscriptions, jobs.
pub mod model;
/// serde helpers for hex/optional-field encodings.
pub mod serde_helpers;
/// sha256 convenience module, used for content-addressed storage keys.
pub mod sha256;
/// `TimestampMillis`.
pub mod time;

/// A trait which allows us to apply functions (including tuple enum variants)
/// to non-[`Iterator`]/[`Result`]/[`Option`] values for cleaner iterator-like
/// chains.
///
/// Instead of:
///
/// ```
/// let n: u64 = 100_000;
/// let maybe_value = u32::try_from(n).ok().map(|v| v * 2);
/// ```
///
/// we can remove the nested combinators:
///
/// ```
/// use cuenly_common::Apply;
/// let n: u64 = 100_000;
/// let maybe_value = u32::try_from(n)
///     .ok()
///     .apply(|opt| opt.map(|v| v * 2));
/// ```
pub trait Apply<F, T> {
    fn apply(self, f: F) -> T;
}

impl<F, T, U> Apply<F, U> for T
where
    F: FnOnce(T) -> U,
{
    #[inline]
    fn apply(self, f: F) -> U {
        f(self)
    }
}

/// Assert at compile time that a boolean expression evaluates to true.
/// Implementation copied from the static_assertions crate.
#[macro_export]
macro_rules! const_assert {
    ($x:expr $(,)?) => {
        #[allow(clippy::const_is_empty, clippy::eq_op, unknown_lints)]
        const _: [(); 0 - !{
            const CONST_ASSERT: bool = $x;
            CONST_ASSERT
        } as usize] = [];
    };
}
