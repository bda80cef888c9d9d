//! Typed domain separators for canonical hashing.
//!
//! Every production hash computation MUST select a domain via [`HashDomain`].
//! This module is the single authority for domain-separator byte strings.
//! Adding a new domain is a single change here: the enum, `as_bytes()`,
//! `ALL`, and `Display` are all generated from the same macro invocation.

/// Declares `HashDomain` enum, `as_bytes()`, `ALL`, and `Display` from one list.
macro_rules! define_hash_domains {
    (
        $(
            $(#[$meta:meta])*
            $variant:ident => $bytes:expr
        ),+ $(,)?
    ) => {
        /// Typed domain separator for [`super::hash::canonical_hash`].
        ///
        /// Every variant maps to a unique, null-terminated byte string used as
        /// a SHA-256 prefix.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum HashDomain {
            $(
                $(#[$meta])*
                $variant,
            )+
        }

        impl HashDomain {
            /// The raw domain-separator bytes (null-terminated).
            #[must_use]
            pub const fn as_bytes(&self) -> &'static [u8] {
                match self {
                    $( Self::$variant => $bytes, )+
                }
            }

            /// All domain variants in declaration order.
            ///
            /// Generated from the same macro invocation as the enum; cannot diverge.
            pub const ALL: &[HashDomain] = &[
                $( Self::$variant, )+
            ];
        }

        impl core::fmt::Display for HashDomain {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                match self {
                    $( Self::$variant => write!(f, stringify!($variant)), )+
                }
            }
        }
    };
}

define_hash_domains! {
    // -----------------------------------------------------------------------
    // Event store
    // -----------------------------------------------------------------------

    /// Chain root: the well-known `prev_hash` of every run's first event.
    EventGenesis => b"KEEL::EVENT_GENESIS::V1\0",

    /// Chained event commitment: `sha256(domain || prev || canonical(event))`.
    EventChain => b"KEEL::EVENT_CHAIN::V1\0",

    /// Snapshot commitment over the anchoring event hash and the state bytes.
    Snapshot => b"KEEL::SNAPSHOT::V1\0",

    /// Materialized state digest (replay determinism comparisons).
    StateDigest => b"KEEL::STATE_DIGEST::V1\0",

    // -----------------------------------------------------------------------
    // Orchestrator
    // -----------------------------------------------------------------------

    /// Artifact content addressing.
    ArtifactContent => b"KEEL::ARTIFACT_CONTENT::V1\0",

    /// Verification result digest (re-run comparisons for audits).
    Verification => b"KEEL::VERIFICATION::V1\0",

    // -----------------------------------------------------------------------
    // Harness
    // -----------------------------------------------------------------------

    /// Test spec identity hashing.
    TestSpec => b"KEEL::TEST_SPEC::V1\0",

    /// Persisted trace digest in the test log store.
    TraceDigest => b"KEEL::TRACE_DIGEST::V1\0",
}
