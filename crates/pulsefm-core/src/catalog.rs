//! The fixed pool of mood/genre descriptors PollEngine samples poll options
//! from.
//!
//! `openPoll` draws `options_per_window` distinct entries uniformly at
//! random from [`DESCRIPTORS`].

use rand::seq::SliceRandom;

pub const DESCRIPTORS: &[&str] = &[
    "dreamy", "driving", "glitchy", "warm", "hazy", "frantic", "sparse", "lush",
    "melancholy", "triumphant", "gritty", "shimmering", "brooding", "playful",
    "nostalgic", "industrial", "floaty", "percussive", "cinematic", "minimal",
    "ambient", "aggressive", "serene", "jittery", "woozy", "crystalline",
    "murky", "upbeat", "somber", "manic", "tranquil", "distorted", "ethereal",
    "raw", "polished", "lo-fi", "hi-fi", "syncopated", "droning", "bouncy",
    "sultry", "frosty", "sun-baked", "claustrophobic", "expansive", "jagged",
    "smooth", "restless", "hypnotic", "euphoric", "wistful", "menacing",
    "tender", "chaotic", "orderly", "spectral", "earthy", "metallic",
    "organic", "synthetic", "languid", "frenetic", "muted", "vivid",
    "skeletal", "dense", "airy", "sludgy", "buoyant", "somnolent", "feral",
    "clinical", "wounded", "defiant", "gentle", "violent", "weightless",
    "leaden", "incandescent", "subterranean", "celestial", "feverish",
    "glacial", "molten", "threadbare", "opulent", "derelict", "luminous",
    "shadowed", "kinetic", "static", "unraveling", "coalescing", "submerged",
    "soaring", "crawling", "stuttering", "cascading", "pulsing", "drifting",
    "searing", "wilting",
];

/// Draw `n` distinct descriptors uniformly at random. `n` is clamped to the
/// catalog's size so a misconfigured `options_per_window` can't panic.
pub fn sample_options(n: usize) -> Vec<String> {
    let n = n.min(DESCRIPTORS.len());
    let mut rng = rand::thread_rng();
    DESCRIPTORS
        .choose_multiple(&mut rng, n)
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_has_enough_entries_for_any_reasonable_window() {
        assert!(DESCRIPTORS.len() >= 100);
    }

    #[test]
    fn sample_options_returns_distinct_entries() {
        let opts = sample_options(4);
        assert_eq!(opts.len(), 4);
        let mut sorted = opts.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 4);
        for opt in &opts {
            assert!(DESCRIPTORS.contains(&opt.as_str()));
        }
    }

    #[test]
    fn sample_options_clamps_to_catalog_size() {
        let opts = sample_options(10_000);
        assert_eq!(opts.len(), DESCRIPTORS.len());
    }
}
