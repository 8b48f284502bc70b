//! Payload translation between the two networks
//!
//! Pure functions: no I/O happens here. Remote attachment URLs are carried
//! through as `FileUpload`s / `LocalAttachment`s and fetched by the router.

use crate::types::{
    AttachmentKind, EmbedSpec, ExternalAttachment, ExternalDraft, ExternalMessage, FileUpload,
    LocalMessage, LocalPayload,
};

/// Sent instead of an empty body; the local server rejects empty posts.
pub const EMPTY_BODY_PLACEHOLDER: &str = "\u{200b}";

/// Audio sub-formats the local server cannot play inline
const DISALLOWED_AUDIO_EXTENSIONS: &[&str] = &["m4a"];
const DISALLOWED_AUDIO_TYPES: &[&str] = &["audio/x-m4a", "audio/mp4"];

/// Longest display name accepted by a named endpoint
const MAX_USERNAME_CHARS: usize = 80;

/// Profile picture of an external user, used as the endpoint avatar
pub fn avatar_url(sender_id: &str) -> String {
    format!("https://graph.facebook.com/{}/picture?type=large", sender_id)
}

/// Translate an external message into a local payload.
///
/// `has_endpoint` selects how attribution is carried: display-name and
/// avatar overrides plus a thread footer through a named endpoint,
/// otherwise an embed footer or a content suffix.
pub fn to_local(msg: &ExternalMessage, has_endpoint: bool) -> LocalPayload {
    let mut payload = match msg.attachments.as_slice() {
        [] => LocalPayload {
            content: msg.body.clone(),
            ..Default::default()
        },
        [single] => single_attachment(&msg.body, single),
        many => LocalPayload {
            content: msg.body.clone(),
            files: many
                .iter()
                .enumerate()
                .filter_map(|(i, att)| upload_for(att, i))
                .collect(),
            ..Default::default()
        },
    };

    attribute(&mut payload, msg, has_endpoint);

    let has_image = payload.embeds.iter().any(|e| e.image_url.is_some());
    if payload.content.trim().is_empty() && !has_image && payload.files.is_empty() {
        payload.content = EMPTY_BODY_PLACEHOLDER.to_string();
    }
    payload
}

fn single_attachment(body: &str, att: &ExternalAttachment) -> LocalPayload {
    match (&att.kind, &att.url) {
        (kind, Some(url)) if kind.is_image() => LocalPayload {
            content: body.to_string(),
            embeds: vec![EmbedSpec {
                image_url: Some(url.clone()),
                footer: None,
            }],
            ..Default::default()
        },
        (AttachmentKind::Audio, _) if is_disallowed_audio(att) => LocalPayload {
            content: join_lines(body, &unsupported_audio_notice(att)),
            ..Default::default()
        },
        _ => match upload_for(att, 0) {
            Some(upload) => LocalPayload {
                content: body.to_string(),
                files: vec![upload],
                ..Default::default()
            },
            None => LocalPayload {
                content: join_lines(body, &placeholder_note(att)),
                ..Default::default()
            },
        },
    }
}

/// Re-upload description for attachments the local server can host.
/// Location, file, share and unknown kinds are never uploadable.
fn upload_for(att: &ExternalAttachment, index: usize) -> Option<FileUpload> {
    let uploadable = att.kind.is_image()
        || att.kind == AttachmentKind::Video
        || (att.kind == AttachmentKind::Audio && !is_disallowed_audio(att));
    if !uploadable {
        return None;
    }
    let url = att.url.as_ref()?;
    Some(FileUpload {
        url: url.clone(),
        filename: attachment_filename(att, index),
    })
}

fn is_disallowed_audio(att: &ExternalAttachment) -> bool {
    if att.kind != AttachmentKind::Audio {
        return false;
    }
    let by_extension = extension(att).is_some_and(|ext| {
        DISALLOWED_AUDIO_EXTENSIONS
            .iter()
            .any(|d| d.eq_ignore_ascii_case(&ext))
    });
    // Parameters such as `; codecs=...` do not change the container
    let by_type = att.content_type.as_deref().is_some_and(|ct| {
        let essence = ct.split(';').next().unwrap_or(ct).trim();
        DISALLOWED_AUDIO_TYPES
            .iter()
            .any(|d| d.eq_ignore_ascii_case(essence))
    });
    by_extension || by_type
}

fn extension(att: &ExternalAttachment) -> Option<String> {
    let name = att
        .filename
        .clone()
        .or_else(|| att.url.as_deref().map(url_file_name))?;
    let (_, ext) = name.rsplit_once('.')?;
    Some(ext.to_lowercase())
}

/// Last path segment of a URL, without query or fragment
fn url_file_name(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().unwrap_or(path).to_string()
}

fn attachment_filename(att: &ExternalAttachment, index: usize) -> String {
    if let Some(name) = att.filename.as_deref().filter(|n| !n.is_empty()) {
        return name.to_string();
    }
    if let Some(name) = att
        .url
        .as_deref()
        .map(url_file_name)
        .filter(|n| n.contains('.'))
    {
        return name;
    }
    let ext = match att.kind {
        AttachmentKind::Photo => "jpg",
        AttachmentKind::AnimatedImage => "gif",
        AttachmentKind::Sticker => "png",
        AttachmentKind::Audio => "mp3",
        AttachmentKind::Video => "mp4",
        _ => "bin",
    };
    format!("{}-{}.{}", att.kind, index + 1, ext)
}

fn unsupported_audio_notice(att: &ExternalAttachment) -> String {
    match &att.filename {
        Some(name) => format!("[voice clip {} is in an unsupported format]", name),
        None => "[voice clip in an unsupported format]".to_string(),
    }
}

fn placeholder_note(att: &ExternalAttachment) -> String {
    let what = match att.kind {
        AttachmentKind::Location => "a location",
        AttachmentKind::File => "a file",
        AttachmentKind::Share => "a link",
        _ => "an attachment",
    };
    match (&att.filename, &att.url) {
        (Some(name), _) => format!("[shared {}: {}]", what, name),
        (None, Some(url)) if att.kind == AttachmentKind::Share => format!("[shared {}: {}]", what, url),
        _ => format!("[shared {}]", what),
    }
}

fn attribute(payload: &mut LocalPayload, msg: &ExternalMessage, has_endpoint: bool) {
    let sender = match msg.sender_name.as_deref().filter(|n| !n.trim().is_empty()) {
        Some(name) => format!("{} ({})", name, msg.sender_id),
        None => msg.sender_id.clone(),
    };
    if has_endpoint {
        payload.username = Some(sender.chars().take(MAX_USERNAME_CHARS).collect());
        payload.avatar_url = Some(avatar_url(&msg.sender_id));
        let footer = format!("thread {}", msg.thread_id);
        if payload.embeds.is_empty() {
            payload.embeds.push(EmbedSpec {
                image_url: None,
                footer: Some(footer),
            });
        } else {
            for embed in &mut payload.embeds {
                embed.footer = Some(footer.clone());
            }
        }
        return;
    }

    let line = format!("{} · thread {}", sender, msg.thread_id);
    match payload.embeds.first_mut() {
        Some(embed) => embed.footer = Some(line),
        None => payload.content = join_lines(&payload.content, &format!("— {}", line)),
    }
}

/// Note appended when files could not be fetched for upload
pub fn dropped_files_notice(filenames: &[&str]) -> String {
    match filenames {
        [] => String::new(),
        [one] => format!("[attachment {} could not be relayed]", one),
        many => format!("[attachments {} could not be relayed]", many.join(", ")),
    }
}

pub(crate) fn join_lines(first: &str, second: &str) -> String {
    if first.is_empty() {
        second.to_string()
    } else {
        format!("{}\n{}", first, second)
    }
}

/// Translate a local message into an external draft: body plus the
/// author's tag, with attachment URLs still to be fetched.
pub fn to_external_draft(msg: &LocalMessage) -> ExternalDraft {
    let body = if msg.body.is_empty() {
        msg.author_tag.clone()
    } else {
        format!("{}\n\n{}", msg.body, msg.author_tag)
    };
    ExternalDraft {
        body,
        attachment_urls: msg.attachments.clone(),
    }
}
