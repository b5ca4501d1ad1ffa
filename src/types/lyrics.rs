//! Placeholder lyrics
//!
//! Instant song-shaped lyrics for test runs, lightly steered by the caption
//! and tempo. No language model is involved.

use rand::seq::SliceRandom;
use rand::Rng;

/// Used when the caption has no usable keyword.
const FALLBACK_KEYWORD: &str = "tonight";
const SECOND_KEYWORDS: [&str; 6] = ["neon", "heartbeat", "river", "echo", "firelight", "midnight"];

/// Production terms that make poor lyrics.
const KEYWORD_BLACKLIST: [&str; 29] = [
    "bpm", "kick", "snare", "hats", "hi-hats", "hihat", "bass", "sub", "mix", "stereo", "reverb",
    "delay", "master", "eq", "compressor", "house", "techno", "trance", "dubstep", "drums",
    "synth", "pads", "vocal", "vocals", "female", "male", "chops", "loop", "loops",
];

const DARK_CUES: [&str; 6] = ["dark", "midnight", "late-night", "underground", "smoke", "shadow"];
const BRIGHT_CUES: [&str; 6] = ["uplift", "euphor", "bright", "sun", "summer", "anthem"];
const DARK_PALETTE: [&str; 5] = ["streetlights", "low tide", "cold air", "afterhours", "slow burn"];
const BRIGHT_PALETTE: [&str; 5] = ["sunrise", "open sky", "golden hours", "wide open", "runaway"];
const NEUTRAL_PALETTE: [&str; 5] = ["neon", "sparks", "city rain", "pulse", "gravity"];

const ADLIBS: [&str; 6] = ["(oh)", "(yeah)", "(hold up)", "(come on)", "(let it go)", "(mm-hm)"];

/// Lyrical words from `caption`: ASCII, at least four letters, no
/// production jargon. Order is kept and duplicates are not removed.
pub fn caption_keywords(caption: &str) -> Vec<String> {
    const TRIM: &[char] = &['.', ',', '!', '?', ';', ':', '(', ')', '[', ']', '{', '}', '"', '\''];
    caption
        .split_whitespace()
        .map(|w| w.trim_matches(TRIM).to_lowercase())
        .filter(|w| w.len() >= 4 && w.is_ascii())
        .filter(|w| !KEYWORD_BLACKLIST.contains(&w.as_str()))
        .collect()
}

/// Section tag such as `[120 BPM, 4/4]`. Tempos under 60 are left out.
pub fn tempo_tag(bpm: u32, timesignature: u32) -> String {
    let ts = (timesignature > 0).then(|| format!("{}/4", timesignature));
    match (bpm >= 60, ts) {
        (true, Some(ts)) => format!("[{} BPM, {}]", bpm, ts),
        (true, None) => format!("[{} BPM]", bpm),
        (false, Some(ts)) => format!("[{}]", ts),
        (false, None) => String::new(),
    }
}

fn mood_palette(caption: &str) -> &'static [&'static str] {
    let caption = caption.to_lowercase();
    if DARK_CUES.iter().any(|cue| caption.contains(cue)) {
        &DARK_PALETTE
    } else if BRIGHT_CUES.iter().any(|cue| caption.contains(cue)) {
        &BRIGHT_PALETTE
    } else {
        &NEUTRAL_PALETTE
    }
}

fn pick<'a, R: Rng>(rng: &mut R, items: &'a [&'a str]) -> &'a str {
    items.choose(rng).copied().unwrap_or_default()
}

fn pick_keywords<R: Rng>(rng: &mut R, words: &[String]) -> (String, String) {
    let kw1 = words
        .choose(rng)
        .cloned()
        .unwrap_or_else(|| FALLBACK_KEYWORD.to_string());

    let kw2 = if words.len() >= 2 {
        (0..6)
            .filter_map(|_| words.choose(rng))
            .find(|cand| **cand != kw1)
            .cloned()
            .unwrap_or_else(|| kw1.clone())
    } else if kw1 == FALLBACK_KEYWORD {
        pick(rng, &SECOND_KEYWORDS).to_string()
    } else {
        FALLBACK_KEYWORD.to_string()
    };
    (kw1, kw2)
}

/// Placeholder lyrics for `caption` at the given tempo.
pub fn placeholder_lyrics(caption: &str, bpm: u32, timesignature: u32) -> String {
    placeholder_lyrics_with(&mut rand::thread_rng(), caption, bpm, timesignature)
}

/// [`placeholder_lyrics`] with a caller-supplied random source.
pub fn placeholder_lyrics_with<R: Rng>(
    rng: &mut R,
    caption: &str,
    bpm: u32,
    timesignature: u32,
) -> String {
    let words = caption_keywords(caption);
    let (kw1, kw2) = pick_keywords(rng, &words);
    let scene = pick(rng, mood_palette(caption));
    let ad1 = pick(rng, &ADLIBS);
    let ad2 = pick(rng, &ADLIBS);

    let hook = match rng.gen_range(0..3) {
        0 => [
            format!("{kw1} {kw1}, keep it close"),
            format!("{kw2} {kw2}, let it go"),
        ],
        1 => [
            format!("{kw1} on my tongue {ad1}"),
            format!("{kw2} in my lungs {ad2}"),
        ],
        _ => [
            format!("Say {kw1}, say it twice"),
            format!("Say {kw2}, roll the dice"),
        ],
    };
    let chorus = format!(
        "{}\n{}\nAll night long, we don't lose the spark\nMeet me where the {kw1} leaves a mark\n",
        hook[0], hook[1]
    );

    let mut text = String::new();
    let tag = tempo_tag(bpm, timesignature);
    if !tag.is_empty() {
        text.push_str(&tag);
        text.push('\n');
    }
    text.push_str(&format!(
        "[Verse 1]\n\
         {kw1} in the {scene}, I feel it start\n\
         Hands on the wheel, {kw2} in my heart\n\
         Foot on the line, we lean into the sound\n\
         Count to four, let the floor shake the ground\n\n\
         [Pre-Chorus]\n\
         If we fall, we fall upward {ad1}\n\
         Breathing in, breathing out, keep it moving\n\
         No more ghosts, only {kw1} {ad2}\n\
         When it drops, you know what we're doing\n\n\
         [Chorus]\n\
         {chorus}\n\
         [Verse 2]\n\
         {kw2} in the mirror, I like that look\n\
         {kw1} in the rhythm, got me by the hook\n\
         We chase the skyline, faster than doubt\n\
         Turn it up, turn it up, drown it out\n\n\
         [Bridge]\n\
         Hold that note, let it hover in the air\n\
         One step back, then we go everywhere\n\
         If you need a sign, it's written in the bass\n\
         Close your eyes, feel the room change its face\n\n\
         [Final Chorus]\n\
         {chorus}\n\
         [Outro]\n\
         {kw1}... {kw2}... fade it slow\n"
    ));
    text
}
