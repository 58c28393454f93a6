//! Post-processing of exported page content.
//!
//! Markdown exports drop embedded images and leave a run of blank lines in
//! their place. The HTML rendition of the same page still carries the
//! `<img>` tags, in document order, so the two can be re-aligned.
//!
//! People mentions arrive as `[@Name](mailto:email)` links and are rewritten
//! into destination mention tokens once the users are resolved.

use bridge_traits::destination::User;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashMap;
use uuid::Uuid;

static IMAGE_PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

static IMG_SRC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)<img\b[^>]*?\bsrc\s*=\s*["']([^"']+)["']"#).unwrap());

static MENTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[@([^\]]+)\]\(mailto:([^)\s]+)\)").unwrap());

pub fn has_image_placeholders(markdown: &str) -> bool {
    IMAGE_PLACEHOLDER.is_match(markdown)
}

/// Image sources in document order.
pub fn extract_image_sources(html: &str) -> Vec<String> {
    IMG_SRC
        .captures_iter(html)
        .map(|c| c[1].to_string())
        .collect()
}

/// Put `images` back into the blank-line runs of `markdown`, in order.
///
/// Placeholders without an image keep their blank lines; images without a
/// placeholder are appended at the end.
pub fn splice_images(markdown: &str, images: &[String]) -> String {
    let mut remaining = images.iter();

    let mut spliced = IMAGE_PLACEHOLDER
        .replace_all(markdown, |caps: &Captures| match remaining.next() {
            Some(src) => format!("\n\n![]({})\n\n", src),
            None => caps[0].to_string(),
        })
        .into_owned();

    for src in remaining {
        if !spliced.ends_with('\n') {
            spliced.push('\n');
        }
        spliced.push_str(&format!("\n![]({})\n", src));
    }
    spliced
}

/// Distinct mention emails in first-seen order.
pub fn mention_emails(markdown: &str) -> Vec<String> {
    let mut emails: Vec<String> = Vec::new();
    for caps in MENTION.captures_iter(markdown) {
        let email = caps[2].to_lowercase();
        if !emails.contains(&email) {
            emails.push(email);
        }
    }
    emails
}

/// Rewrite mention links into destination mention tokens.
///
/// Mentions whose email is not among `users` degrade to plain `@Name`.
pub fn rewrite_mentions(markdown: &str, users: &[User]) -> String {
    let by_email: HashMap<String, &User> = users
        .iter()
        .filter_map(|u| u.email.as_ref().map(|e| (e.to_lowercase(), u)))
        .collect();

    MENTION
        .replace_all(markdown, |caps: &Captures| {
            let name = &caps[1];
            match by_email.get(&caps[2].to_lowercase()) {
                Some(user) => format!(
                    "@[{}](mention://{}/user/{})",
                    user.name,
                    Uuid::new_v4(),
                    user.id
                ),
                None => format!("@{}", name),
            }
        })
        .into_owned()
}
