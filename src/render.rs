use crate::web::models::{Message, Role};

pub const DEFAULT_USER_AVATAR: &str = "🧑";
pub const DEFAULT_ASSISTANT_AVATAR: &str = "🤖";

fn role_class(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
    }
}

fn avatar_html(avatar: &str) -> String {
    let avatar = avatar.trim();
    if avatar.starts_with("http://") || avatar.starts_with("https://") || avatar.starts_with('/') {
        format!(
            "<img class=\"chat-avatar\" src=\"{}\" alt=\"\">",
            html_escape::encode_double_quoted_attribute(avatar)
        )
    } else {
        format!(
            "<span class=\"chat-avatar\">{}</span>",
            html_escape::encode_text(avatar)
        )
    }
}

// Content is escaped; newlines become `<br>`.
pub fn message_html(role: Role, content: &str, avatar: &str) -> String {
    let text = html_escape::encode_text(content).replace('\n', "<br>");
    format!(
        "<div class=\"chat-message chat-message-{}\">{}<div class=\"chat-text\">{}</div></div>",
        role_class(role),
        avatar_html(avatar),
        text
    )
}

// System messages are skipped.
pub fn history_html(history: &[Message], user_avatar: &str, assistant_avatar: &str) -> String {
    history
        .iter()
        .filter_map(|m| match m.role {
            Role::User => Some(message_html(Role::User, &m.content, user_avatar)),
            Role::Assistant => Some(message_html(Role::Assistant, &m.content, assistant_avatar)),
            Role::System => None,
        })
        .collect()
}
