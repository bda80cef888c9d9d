//! Hash domain governance lock tests.
//!
//! Proves:
//! 1. Canonical domain set has expected count (catches forgotten additions to ALL)
//! 2. All domain byte strings are unique
//! 3. All domains follow the `KEEL::*::V1\0` naming convention
//! 4. No raw `KEEL::` domain literals in production source outside `hash_domain.rs`
//! 5. Golden vectors: the genesis seed and a content hash are pinned

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use keel_kernel::proof::hash::{canonical_hash, genesis_hash, HashDomain};

// ---------------------------------------------------------------------------
// 1. Canonical set count
// ---------------------------------------------------------------------------

#[test]
fn hash_domain_canonical_set_count() {
    assert_eq!(
        HashDomain::ALL.len(),
        8,
        "expected 8 domain variants; if you added a new domain, update this count"
    );
}

// ---------------------------------------------------------------------------
// 2. All unique bytes
// ---------------------------------------------------------------------------

#[test]
fn hash_domain_all_unique_bytes() {
    let mut seen = BTreeSet::new();
    for domain in HashDomain::ALL {
        assert!(
            seen.insert(domain.as_bytes()),
            "duplicate domain bytes: {domain}"
        );
    }
}

// ---------------------------------------------------------------------------
// 3. Naming convention
// ---------------------------------------------------------------------------

#[test]
fn hash_domain_all_follow_naming_convention() {
    for domain in HashDomain::ALL {
        let bytes = domain.as_bytes();
        assert!(bytes.starts_with(b"KEEL::"), "{domain} does not start with KEEL::");
        assert!(bytes.ends_with(b"::V1\0"), "{domain} does not end with ::V1\\0");
    }
}

// ---------------------------------------------------------------------------
// 4. No raw KEEL:: domain literals in production source
// ---------------------------------------------------------------------------

#[test]
fn no_raw_domain_literals_outside_authority() {
    let production_dirs = [
        concat!(env!("CARGO_MANIFEST_DIR"), "/../../kernel/src"),
        concat!(env!("CARGO_MANIFEST_DIR"), "/../../orchestrator/src"),
        concat!(env!("CARGO_MANIFEST_DIR"), "/../../harness/src"),
    ];
    let pattern = "b\"KEEL::";
    let authority_file = "hash_domain.rs";

    let mut violations = Vec::new();
    for dir in production_dirs {
        for path in rust_files(Path::new(dir)) {
            if path.file_name().and_then(|n| n.to_str()) == Some(authority_file) {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            for (i, line) in content.lines().enumerate() {
                let trimmed = line.trim();
                if !trimmed.starts_with("//") && trimmed.contains(pattern) {
                    violations.push(format!("  {}:{}: {trimmed}", path.display(), i + 1));
                }
            }
        }
    }

    assert!(
        violations.is_empty(),
        "raw KEEL:: domain literals found outside {authority_file}:\n{}",
        violations.join("\n")
    );
}

fn rust_files(dir: &Path) -> Vec<PathBuf> {
    let mut results = Vec::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                results.extend(rust_files(&path));
            } else if path.extension().and_then(|e| e.to_str()) == Some("rs") {
                results.push(path);
            }
        }
    }
    results
}

// ---------------------------------------------------------------------------
// 5. Golden vectors
// ---------------------------------------------------------------------------

/// A change here invalidates every persisted log.
#[test]
fn genesis_seed_is_pinned() {
    assert_eq!(
        genesis_hash().as_str(),
        "sha256:d0d851eeb82f25e1de34006e2a861690e13368a84444651d541247e0eaf2f9e5"
    );
}

#[test]
fn artifact_content_hash_is_pinned() {
    assert_eq!(
        canonical_hash(HashDomain::ArtifactContent, b"hello").as_str(),
        "sha256:073e04d49902cb901ab0635351c4ef70e589e90cfd58a5b0f4450a84cae3f2e7"
    );
}
