//! Virtual block identities
//!
//! A block inside a loop or parallel container runs once per iteration. Each
//! run gets its own identity token of the form
//! `<originalId>_parallel_<parallelId>_iteration_<n>`, which can be used
//! anywhere a plain block id is accepted.
//!
//! Nested containers compose: the identity is wrapped once per enclosing
//! container, innermost first, so the outermost container sits at the end of
//! the token.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Marker between the original id and the parallel (container) id
pub const PARALLEL_MARKER: &str = "_parallel_";

/// Marker between the parallel id and the iteration index
pub const ITERATION_MARKER: &str = "_iteration_";

/// Decoded form of a virtual identity token
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualBlockId {
    pub original_id: String,
    pub parallel_id: String,
    pub iteration: usize,
}

impl VirtualBlockId {
    pub fn new(original_id: impl Into<String>, parallel_id: impl Into<String>, iteration: usize) -> Self {
        Self {
            original_id: original_id.into(),
            parallel_id: parallel_id.into(),
            iteration,
        }
    }

    pub fn token(&self) -> String {
        encode(&self.original_id, &self.parallel_id, self.iteration)
    }
}

impl fmt::Display for VirtualBlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}{}{}",
            self.original_id, PARALLEL_MARKER, self.parallel_id, ITERATION_MARKER, self.iteration
        )
    }
}

/// Build the token for one iteration of a block.
pub fn encode(original_id: &str, parallel_id: &str, iteration: usize) -> String {
    format!(
        "{}{}{}{}{}",
        original_id, PARALLEL_MARKER, parallel_id, ITERATION_MARKER, iteration
    )
}

/// Cheap pre-filter: both markers occur somewhere in the token.
///
/// Marker order is not checked; use [`decode`] for a strict answer.
pub fn is_virtual(token: &str) -> bool {
    token.contains(PARALLEL_MARKER) && token.contains(ITERATION_MARKER)
}

/// Strictly parse `<originalId>_parallel_<parallelId>_iteration_<digits>`.
///
/// Returns `None` whenever the grammar does not match, even if
/// [`is_virtual`] said yes. Callers treat `None` as "plain id".
pub fn decode(token: &str) -> Option<VirtualBlockId> {
    split(token).map(|(original, parallel, iteration)| VirtualBlockId::new(original, parallel, iteration))
}

/// Resolve any token back to the id of its block definition.
///
/// Plain ids and malformed virtual-looking tokens come back unchanged. Nested
/// identities are unwrapped layer by layer.
pub fn extract_original(token: &str) -> &str {
    let mut current = token;
    while is_virtual(current) {
        match split(current) {
            Some((original, _, _)) => current = original,
            None => break,
        }
    }
    current
}

fn split(token: &str) -> Option<(&str, &str, usize)> {
    let iteration_at = token.rfind(ITERATION_MARKER)?;
    let digits = &token[iteration_at + ITERATION_MARKER.len()..];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let iteration: usize = digits.parse().ok()?;

    // The original id is the greedy group: prefer the last marker that still
    // leaves a non-empty parallel id.
    let head = &token[..iteration_at];
    head.rmatch_indices(PARALLEL_MARKER)
        .map(|(at, _)| (&head[..at], &head[at + PARALLEL_MARKER.len()..]))
        .find(|(original, parallel)| !original.is_empty() && !parallel.is_empty())
        .map(|(original, parallel)| (original, parallel, iteration))
}

/// Identity of `block_id` as seen from inside the given container frames.
///
/// `path` lists `(container_id, iteration)` pairs from the outermost container
/// to the innermost one.
pub fn scoped_id(block_id: &str, path: &[(String, usize)]) -> String {
    path.iter()
        .rev()
        .fold(block_id.to_string(), |id, (container, iteration)| {
            encode(&id, container, *iteration)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_uses_both_markers() {
        assert_eq!(encode("add", "l1", 2), "add_parallel_l1_iteration_2");
    }

    #[test]
    fn round_trip() {
        for (o, p, i) in [("add", "l1", 0), ("block-7", "p", 42), ("x", "y", usize::MAX)] {
            let token = encode(o, p, i);
            assert_eq!(decode(&token), Some(VirtualBlockId::new(o, p, i)));
            assert_eq!(extract_original(&token), o);
            assert!(is_virtual(&token));
        }
    }

    #[test]
    fn plain_ids_pass_through() {
        for id in ["start", "agent-1", "a_b_c", "9f1c2d"] {
            assert!(!is_virtual(id));
            assert_eq!(decode(id), None);
            assert_eq!(extract_original(id), id);
        }
    }

    #[test]
    fn malformed_tokens_degrade_to_plain() {
        let cases = [
            "add_parallel_l1_iteration_x",
            "add_parallel_l1_iteration_",
            "add_parallel_l1_iteration_1a",
            "_parallel_l1_iteration_3",
            "add_parallel__iteration_3",
            "add_iteration_3_parallel_l1",
            "add_parallel_l1_iteration_-1",
        ];
        for token in cases {
            assert_eq!(decode(token), None, "{token}");
            assert_eq!(extract_original(token), token);
        }
    }

    #[test]
    fn iteration_overflow_is_not_virtual() {
        let token = "a_parallel_p_iteration_99999999999999999999999999";
        assert!(is_virtual(token));
        assert_eq!(decode(token), None);
        assert_eq!(extract_original(token), token);
    }

    #[test]
    fn marker_text_inside_original_id_is_greedy() {
        let token = encode("my_parallel_block", "p1", 3);
        let decoded = decode(&token).unwrap();
        // The greedy first group keeps the marker text in the original id.
        assert_eq!(decoded.original_id, "my_parallel_block");
        assert_eq!(decoded.parallel_id, "p1");
    }

    #[test]
    fn nested_identities_unwrap_fully() {
        let path = vec![("outer".to_string(), 0), ("inner".to_string(), 1)];
        let token = scoped_id("a", &path);
        assert_eq!(token, "a_parallel_inner_iteration_1_parallel_outer_iteration_0");

        let outer = decode(&token).unwrap();
        assert_eq!(outer.parallel_id, "outer");
        assert_eq!(outer.iteration, 0);
        let inner = decode(&outer.original_id).unwrap();
        assert_eq!(inner, VirtualBlockId::new("a", "inner", 1));

        assert_eq!(extract_original(&token), "a");
    }

    #[test]
    fn scoped_id_without_path_is_plain() {
        assert_eq!(scoped_id("end", &[]), "end");
    }

    #[test]
    fn display_matches_encode() {
        let id = VirtualBlockId::new("a", "b", 7);
        assert_eq!(id.to_string(), id.token());
    }
}
