//! Accessors and pure editors over event tag lists.
//!
//! Reads work on any signed [`Event`]. Edits work on [`UnsignedEvent`]
//! templates only: a signed event is immutable by construction, so tag
//! changes happen before the template is handed to the signer.

use nostr::{Event, EventBuilder, Tag, UnsignedEvent};

pub fn get_tag<'a>(event: &'a Event, name: &str) -> Option<&'a Tag> {
    event
        .tags
        .iter()
        .find(|t| t.as_slice().first().is_some_and(|n| n == name))
}

pub fn get_tags<'a>(event: &'a Event, name: &str) -> Vec<&'a Tag> {
    event
        .tags
        .iter()
        .filter(|t| t.as_slice().first().is_some_and(|n| n == name))
        .collect()
}

pub fn get_tag_value<'a>(event: &'a Event, name: &str) -> Option<&'a str> {
    get_tag(event, name)?.as_slice().get(1).map(String::as_str)
}

fn rebuild_with_tags(template: &UnsignedEvent, tags: Vec<Tag>) -> UnsignedEvent {
    EventBuilder::new(template.kind, template.content.clone())
        .tags(tags)
        .custom_created_at(template.created_at)
        .build(template.pubkey)
}

/// Returns a new template with `tag` appended. The input is untouched.
pub fn add_tag(template: &UnsignedEvent, tag: Tag) -> UnsignedEvent {
    let mut tags: Vec<Tag> = template.tags.iter().cloned().collect();
    tags.push(tag);
    rebuild_with_tags(template, tags)
}

/// Returns a new template where every tag named like `tag` is replaced by
/// the single given tuple.
pub fn set_tag(template: &UnsignedEvent, tag: Tag) -> UnsignedEvent {
    let name = tag
        .as_slice()
        .first()
        .cloned()
        .unwrap_or_default();
    let mut tags: Vec<Tag> = template
        .tags
        .iter()
        .filter(|t| !t.as_slice().first().is_some_and(|n| *n == name))
        .cloned()
        .collect();
    tags.push(tag);
    rebuild_with_tags(template, tags)
}

/// Returns a new template without any tag of the given name.
pub fn remove_tag(template: &UnsignedEvent, name: &str) -> UnsignedEvent {
    let tags: Vec<Tag> = template
        .tags
        .iter()
        .filter(|t| !t.as_slice().first().is_some_and(|n| n == name))
        .cloned()
        .collect();
    rebuild_with_tags(template, tags)
}
