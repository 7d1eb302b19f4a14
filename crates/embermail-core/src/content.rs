//! Warmup content generation
//!
//! The engine treats content as opaque: it asks a [`ContentGenerator`] for
//! a subject and an HTML body and sends whatever comes back. The bundled
//! [`TemplateGenerator`] fills light-weight templates with rotating
//! placeholders and re-rolls anything that trips the spam-pattern
//! self-check.

use async_trait::async_trait;
use embermail_common::{Error, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use regex::Regex;
use std::sync::Mutex;

/// Maximum subject length the engine accepts
pub const MAX_SUBJECT_LEN: usize = 500;

/// What kind of content is being produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    /// A fresh conversation opener
    General,
    /// A reply within an existing thread
    Reply,
}

/// A generated subject/body pair
#[derive(Debug, Clone)]
pub struct GeneratedContent {
    pub subject: String,
    pub body_html: String,
}

/// Content source abstraction
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, kind: ContentKind) -> Result<GeneratedContent>;
}

const SUBJECTS: &[&str] = &[
    "Quick hello",
    "Just checking in",
    "Hope your week is going well",
    "Catching up",
    "Thought of you today",
    "How have you been?",
    "A quick note",
    "Long time no talk",
];

const OPENERS: &[&str] = &[
    "Hey there,",
    "Hi,",
    "Hello,",
    "Hey,",
];

const BODIES: &[&str] = &[
    "I was just thinking about {topic} and figured I'd drop you a line. How have things been on your end?",
    "It's been a while since we caught up. I've been busy with {topic} lately, but things are settling down now.",
    "Hope everything is going well with you. I recently started looking into {topic} and it's been quite interesting.",
    "Just wanted to say hello and see how you're doing. I spent some of last week on {topic}, which was fun.",
];

const TOPICS: &[&str] = &[
    "a new book",
    "some weekend plans",
    "a small side project",
    "work travel",
    "a cooking experiment",
    "the local weather",
    "an old photo album",
];

const CLOSINGS: &[&str] = &[
    "Talk soon",
    "Best",
    "Cheers",
    "Take care",
    "All the best",
];

const REPLY_BODIES: &[&str] = &[
    "Thanks for reaching out! Things are going well over here. Let's catch up properly soon.",
    "Good to hear from you! I've been meaning to write back sooner. All good on this side.",
    "Great to see your note. Same old here, mostly. Hope the rest of your week goes smoothly.",
    "Appreciate the message! It's been a busy stretch but things are looking up.",
];

/// Template-driven generator with a spam-pattern self-check
pub struct TemplateGenerator {
    rng: Mutex<StdRng>,
    spam_patterns: Vec<Regex>,
}

impl TemplateGenerator {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            rng: Mutex::new(rng),
            spam_patterns: spam_patterns(),
        }
    }

    /// Whether a subject/body pair avoids the obvious spam trigger
    /// patterns. Generated output must pass before it is returned.
    pub fn passes_spam_check(&self, subject: &str, body: &str) -> bool {
        if subject.is_empty() || body.is_empty() || subject.len() > MAX_SUBJECT_LEN {
            return false;
        }
        // An all-caps subject reads like a promotion.
        let letters: Vec<char> = subject.chars().filter(|c| c.is_alphabetic()).collect();
        if !letters.is_empty() && letters.iter().all(|c| c.is_uppercase()) {
            return false;
        }
        let haystack = format!("{}\n{}", subject, body);
        !self.spam_patterns.iter().any(|p| p.is_match(&haystack))
    }

    fn render(&self, kind: ContentKind) -> GeneratedContent {
        let mut rng = self.rng.lock().unwrap();

        match kind {
            ContentKind::General => {
                let subject = SUBJECTS.choose(&mut *rng).unwrap().to_string();
                let opener = OPENERS.choose(&mut *rng).unwrap();
                let body = BODIES.choose(&mut *rng).unwrap();
                let topic = TOPICS.choose(&mut *rng).unwrap();
                let closing = CLOSINGS.choose(&mut *rng).unwrap();

                let paragraph = body.replace("{topic}", topic);
                let body_html = format!(
                    "<p>{}</p><p>{}</p><p>{},<br>{}</p>",
                    opener,
                    paragraph,
                    closing,
                    signature_touch(&mut *rng)
                );

                GeneratedContent { subject, body_html }
            }
            ContentKind::Reply => {
                let body = REPLY_BODIES.choose(&mut *rng).unwrap();
                let closing = CLOSINGS.choose(&mut *rng).unwrap();
                let body_html = format!("<p>{}</p><p>{}!</p>", body, closing);

                GeneratedContent {
                    // The mail client applies the thread's Re: subject.
                    subject: String::new(),
                    body_html,
                }
            }
        }
    }
}

/// A small human touch at the bottom of the signature block
fn signature_touch<R: Rng>(rng: &mut R) -> &'static str {
    ["M", "J", "A", "S", "R"].choose(rng).unwrap()
}

fn spam_patterns() -> Vec<Regex> {
    [
        r"(?i)(urgent|immediate|action required|act now|limited time|expire)",
        r"(?i)\b(free|gratis|winner|prize|jackpot)\b",
        r"(?i)(click here|buy now|order now|special offer)",
        r"(?i)(100% guaranteed|risk[- ]free|no obligation)",
        r"[!$]{2,}",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid spam pattern"))
    .collect()
}

#[async_trait]
impl ContentGenerator for TemplateGenerator {
    async fn generate(&self, kind: ContentKind) -> Result<GeneratedContent> {
        // The templates are curated to pass the check, but a placeholder
        // combination could in principle trip a pattern; re-roll a few
        // times before giving up.
        for _ in 0..4 {
            let content = self.render(kind);
            let subject_ok = kind == ContentKind::Reply || !content.subject.is_empty();
            if subject_ok && self.passes_spam_check_or_reply(kind, &content) {
                return Ok(content);
            }
        }

        Err(Error::Content(
            "Generator could not produce content passing the spam self-check".to_string(),
        ))
    }
}

impl TemplateGenerator {
    fn passes_spam_check_or_reply(&self, kind: ContentKind, content: &GeneratedContent) -> bool {
        match kind {
            ContentKind::General => self.passes_spam_check(&content.subject, &content.body_html),
            // Replies inherit the thread subject; only the body is checked.
            ContentKind::Reply => self.passes_spam_check("Re", &content.body_html),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_general_content_is_well_formed() {
        let generator = TemplateGenerator::new(Some(5));
        for _ in 0..20 {
            let content = generator.generate(ContentKind::General).await.unwrap();
            assert!(!content.subject.is_empty());
            assert!(content.subject.len() <= MAX_SUBJECT_LEN);
            assert!(content.body_html.starts_with("<p>"));
            assert!(generator.passes_spam_check(&content.subject, &content.body_html));
        }
    }

    #[tokio::test]
    async fn test_reply_content_has_body_only() {
        let generator = TemplateGenerator::new(Some(5));
        let content = generator.generate(ContentKind::Reply).await.unwrap();
        assert!(content.subject.is_empty());
        assert!(!content.body_html.is_empty());
    }

    #[test]
    fn test_spam_check_rejects_trigger_patterns() {
        let generator = TemplateGenerator::new(Some(1));
        assert!(!generator.passes_spam_check("URGENT: act now", "<p>hi</p>"));
        assert!(!generator.passes_spam_check("Free prize inside", "<p>hi</p>"));
        assert!(!generator.passes_spam_check("Hello", "<p>Click here!!!</p>"));
        assert!(!generator.passes_spam_check("HELLO THERE", "<p>hi</p>"));
        assert!(!generator.passes_spam_check("", "<p>hi</p>"));
        assert!(generator.passes_spam_check("Quick hello", "<p>How have you been?</p>"));
    }

    #[test]
    fn test_seeded_generation_is_deterministic() {
        let a = TemplateGenerator::new(Some(99)).render(ContentKind::General);
        let b = TemplateGenerator::new(Some(99)).render(ContentKind::General);
        assert_eq!(a.subject, b.subject);
        assert_eq!(a.body_html, b.body_html);
    }
}
