//! Chat message templates.

use crate::models::DonationEvent;

/// Used when no template is configured.
pub const DEFAULT_TEMPLATE: &str = "Thanks for the {amount}R$ donation by @{username}";

/// Render the chat message for a donation.
///
/// Recognized placeholders are `{amount}`, `{username}` (the sender's handle) and `{message}`.
/// `{{` and `}}` produce literal braces and unknown placeholders are kept as they are. Values are
/// inserted in a single pass, so placeholders inside a donation message are never expanded.
pub fn render(template: Option<&str>, event: &DonationEvent) -> String {
    let template = template.filter(|t| !t.trim().is_empty()).unwrap_or(DEFAULT_TEMPLATE);
    let amount = event.amount.to_string();

    let mut out = String::with_capacity(template.len() + event.message.len());
    let mut rest = template;

    while let Some(pos) = rest.find(&['{', '}'][..]) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if tail.starts_with("{{") {
            out.push('{');
            rest = &tail[2..];
        } else if tail.starts_with("}}") {
            out.push('}');
            rest = &tail[2..];
        } else if let (true, Some(end)) = (tail.starts_with('{'), tail.find('}')) {
            match &tail[1..end] {
                "amount" => out.push_str(&amount),
                "username" => out.push_str(&event.sender_user),
                "message" => out.push_str(&event.message),
                _ => out.push_str(&tail[..=end]),
            }
            rest = &tail[end + 1..];
        } else {
            out.push_str(&tail[..1]);
            rest = &tail[1..];
        }
    }

    out.push_str(rest);
    out
}
