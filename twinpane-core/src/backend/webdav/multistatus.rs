//! `207 Multi-Status` bodies returned by `PROPFIND`.

use quick_xml::Reader;
use quick_xml::events::Event;

use crate::backend::epoch_millis;
use crate::error::SourceError;

pub(crate) const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:resourcetype/>
    <d:getcontentlength/>
    <d:getlastmodified/>
  </d:prop>
</d:propfind>"#;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DavResource {
    /// Raw, still percent-encoded `href`.
    pub href: String,
    pub size: u64,
    pub modified: i64,
    pub collection: bool,
}

#[derive(Clone, Copy)]
enum Field {
    Href,
    Length,
    Modified,
}

pub fn parse(xml: &str) -> Result<Vec<DavResource>, SourceError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut resources = Vec::new();
    let mut current: Option<DavResource> = None;
    let mut field: Option<Field> = None;
    loop {
        let event = reader
            .read_event()
            .map_err(|err| SourceError::Transport(format!("malformed multistatus: {err}")))?;
        match event {
            Event::Start(tag) => match tag.local_name().as_ref() {
                b"response" => current = Some(DavResource::default()),
                b"href" => field = Some(Field::Href),
                b"getcontentlength" => field = Some(Field::Length),
                b"getlastmodified" => field = Some(Field::Modified),
                b"collection" => set_collection(&mut current),
                _ => {}
            },
            Event::Empty(tag) => {
                if tag.local_name().as_ref() == b"collection" {
                    set_collection(&mut current);
                }
            }
            Event::Text(text) => {
                let (Some(field), Some(resource)) = (field, current.as_mut()) else {
                    continue;
                };
                let value = text
                    .unescape()
                    .map_err(|err| {
                        SourceError::Transport(format!("malformed multistatus: {err}"))
                    })?;
                let value = value.trim();
                match field {
                    Field::Href => resource.href = value.to_string(),
                    Field::Length => resource.size = value.parse().unwrap_or(0),
                    Field::Modified => {
                        resource.modified = httpdate::parse_http_date(value)
                            .map(epoch_millis)
                            .unwrap_or(0)
                    }
                }
            }
            Event::End(tag) => match tag.local_name().as_ref() {
                b"response" => {
                    if let Some(resource) = current.take()
                        && !resource.href.is_empty()
                    {
                        resources.push(resource);
                    }
                }
                b"href" | b"getcontentlength" | b"getlastmodified" => field = None,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(resources)
}

fn set_collection(current: &mut Option<DavResource>) {
    if let Some(resource) = current.as_mut() {
        resource.collection = true;
        resource.size = 0;
    }
}
