//! Human-friendly session strings: `adjective-noun-noun`.
//!
//! 256 adjectives × 256² nouns gives 16.7M combinations, enough that a
//! guessed string is overwhelmingly likely to miss while two people on a
//! call can still read one aloud.

use rand::Rng;

/// Upper bound on a session string, format-enforced.
pub const MAX_SESSION_STRING_LEN: usize = 48;

#[rustfmt::skip]
const ADJECTIVES: [&str; 256] = [
    "able", "acid", "aged", "airy", "alert", "alive", "amber", "ample",
    "angry", "apt", "arid", "awake", "azure", "bald", "basic", "beige",
    "bent", "big", "bitter", "black", "bland", "blue", "blunt", "bold",
    "bony", "brave", "brief", "bright", "brisk", "broad", "bronze", "brown",
    "busy", "calm", "candid", "cheap", "chief", "chilly", "civil", "clean",
    "clear", "clever", "close", "cloudy", "coarse", "cold", "cool", "coral",
    "cosmic", "costly", "cozy", "crisp", "curly", "daily", "damp", "dapper",
    "dark", "dear", "deep", "dense", "dim", "direct", "dizzy", "docile",
    "dry", "dual", "dull", "dusty", "eager", "early", "earthy", "easy",
    "eight", "elder", "empty", "equal", "even", "exact", "extra", "faint",
    "fair", "famous", "fancy", "fast", "fierce", "fine", "firm", "first",
    "fit", "five", "flat", "fluent", "fluffy", "foggy", "fond", "formal",
    "four", "frank", "free", "fresh", "frosty", "full", "funny", "fuzzy",
    "gentle", "giant", "giddy", "gilded", "glad", "glassy", "gold", "good",
    "grand", "grassy", "gray", "great", "green", "happy", "hardy", "hasty",
    "hazy", "heavy", "hidden", "high", "hollow", "honest", "huge", "humble",
    "icy", "ideal", "idle", "indigo", "inner", "ivory", "jade", "jolly",
    "keen", "kind", "large", "last", "late", "lavish", "lean", "left",
    "legal", "light", "lime", "little", "lively", "local", "lone", "long",
    "loud", "low", "loyal", "lucid", "lucky", "lunar", "mad", "magic",
    "main", "major", "mellow", "merry", "mighty", "mild", "minor", "minty",
    "misty", "modern", "modest", "moist", "mossy", "muted", "narrow", "navy",
    "near", "neat", "new", "next", "nice", "nimble", "nine", "noble",
    "normal", "north", "old", "olive", "one", "open", "oval", "pale",
    "paper", "past", "patient", "peachy", "pearl", "plain", "plucky", "polar",
    "polite", "proud", "pure", "purple", "quick", "quiet", "rainy", "rapid",
    "rare", "raw", "ready", "real", "red", "regal", "rich", "right",
    "ripe", "rosy", "rough", "round", "royal", "ruby", "rural", "rusty",
    "sable", "safe", "sage", "salty", "sandy", "seven", "sharp", "shiny",
    "short", "shy", "silent", "silver", "simple", "six", "sleek", "slim",
    "small", "smart", "smooth", "snowy", "soft", "solid", "sunny", "swift",
    "tall", "tame", "ten", "tidy", "tiny", "true", "vivid", "warm",
];

#[rustfmt::skip]
const NOUNS: [&str; 256] = [
    "acorn", "alder", "amber", "anchor", "anvil", "apple", "arch", "arrow",
    "ash", "aspen", "atlas", "aurora", "badger", "banjo", "bark", "barley",
    "basin", "beach", "beacon", "bear", "beaver", "bell", "berry", "birch",
    "bison", "bloom", "bluff", "boat", "border", "boulder", "bramble", "brass",
    "breeze", "brick", "bridge", "brook", "bud", "butte", "cabin", "cactus",
    "canal", "canoe", "canyon", "cape", "card", "cedar", "chalk", "chart",
    "cherry", "cliff", "clover", "coast", "cobalt", "comet", "compass", "coral",
    "cosmos", "cotton", "cove", "crane", "crater", "creek", "crest", "crow",
    "crystal", "cypress", "dawn", "deer", "delta", "desert", "dew", "dome",
    "dory", "dove", "drift", "drum", "dune", "eagle", "earth", "echo",
    "eddy", "elk", "elm", "ember", "falcon", "fawn", "feather", "fern",
    "field", "finch", "fjord", "flame", "flint", "flower", "fog", "forest",
    "forge", "fox", "frost", "garnet", "gate", "geyser", "glacier", "glade",
    "glen", "gorge", "granite", "grove", "gull", "harbor", "hare", "hawk",
    "hazel", "heron", "hill", "hollow", "horizon", "ibis", "ice", "inlet",
    "iris", "iron", "island", "ivy", "jasper", "jetty", "juniper", "kelp",
    "kestrel", "kite", "lagoon", "lake", "lantern", "larch", "lark", "laurel",
    "lava", "leaf", "ledge", "lichen", "light", "lily", "linden", "lotus",
    "lynx", "maple", "marble", "marsh", "meadow", "mesa", "mill", "mist",
    "moon", "moose", "moss", "moth", "mountain", "nectar", "nest", "night",
    "oak", "oasis", "ocean", "onyx", "opal", "orchard", "orchid", "osprey",
    "otter", "owl", "oxbow", "pass", "peak", "pebble", "pelican", "pepper",
    "perch", "pier", "pine", "plain", "plateau", "plume", "pond", "poplar",
    "poppy", "prairie", "puffin", "quail", "quarry", "quartz", "quill", "rain",
    "rapids", "raven", "reef", "reed", "ridge", "river", "robin", "rose",
    "rowan", "saddle", "sage", "salmon", "sand", "sapphire", "sea", "seal",
    "shade", "shell", "shoal", "shore", "sky", "sleet", "sloop", "snow",
    "sparrow", "spire", "spring", "spruce", "star", "stone", "storm", "stream",
    "summit", "swan", "tarn", "teal", "thicket", "thorn", "thunder", "tide",
    "timber", "topaz", "trail", "tree", "trout", "tundra", "vale", "valley",
    "vine", "violet", "wave", "wharf", "wheat", "willow", "wind", "wolf",
    "wren", "yarrow", "yew", "zephyr", "zinc", "zircon", "cliffs", "pines",
];

/// Generate a fresh random session string.
pub fn generate() -> String {
    let mut rng = rand::rngs::OsRng;
    let adjective = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
    let noun_a = NOUNS[rng.gen_range(0..NOUNS.len())];
    let noun_b = NOUNS[rng.gen_range(0..NOUNS.len())];
    format!("{adjective}-{noun_a}-{noun_b}")
}

/// Validate the `^[a-z]+-[a-z]+-[a-z]+$` shape and the length cap.
/// Tokens are not required to come from the embedded lists; reservations
/// of arbitrary readable strings are allowed.
pub fn is_valid(s: &str) -> bool {
    if s.is_empty() || s.len() > MAX_SESSION_STRING_LEN {
        return false;
    }
    let mut tokens = 0;
    for token in s.split('-') {
        tokens += 1;
        if token.is_empty() || !token.bytes().all(|b| b.is_ascii_lowercase()) {
            return false;
        }
    }
    tokens == 3
}
