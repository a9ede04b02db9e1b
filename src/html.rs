//! Markup fragment parser.
//!
//! Parses a server-rendered fragment into a detached subtree of the same
//! [`Dom`] arena the live document uses. The result is disposable: the
//! reconciler consumes it node by node, moving what it needs into the live
//! tree and leaving the rest behind as arena garbage.
//!
//! This is a deliberately small single-pass scanner, not a spec-complete HTML
//! parser: server-rendered fragments are machine-written and well-formed.
//! Comments are kept as nodes so the reconciler can reject them.

use crate::{
	dom::{Dom, NodeId},
	Error,
};

const VOID_TAGS: &[&str] = &[
	"area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track", "wbr",
];

pub(crate) fn is_void_tag(tag: &str) -> bool {
	VOID_TAGS.contains(&tag)
}

/// Parses `html` into a detached fragment node whose children are the
/// fragment's top-level nodes.
pub fn parse_fragment(dom: &mut Dom, html: &str) -> Result<NodeId, Error> {
	let fragment = dom.create_fragment();
	let mut stack = vec![fragment];
	let bytes = html.as_bytes();
	let mut i = 0usize;

	while i < bytes.len() {
		if starts_with_at(bytes, i, b"<!--") {
			let end = find_subslice(bytes, i + 4, b"-->").ok_or_else(|| Error::Parse("unclosed comment".into()))?;
			let comment = dom.create_comment(&html[i + 4..end]);
			let parent = *stack.last().ok_or_else(|| Error::Parse("invalid stack state".into()))?;
			dom.append_child(parent, comment);
			i = end + 3;
			continue;
		}

		if bytes[i] == b'<' {
			if starts_with_at(bytes, i, b"</") {
				let (tag, next) = parse_end_tag(html, i)?;
				i = next;

				// Close up to the matching open tag; mis-nested markup just
				// pops whatever is on top, the way lenient scanners do.
				while stack.len() > 1 {
					let top = *stack.last().ok_or_else(|| Error::Parse("invalid stack state".into()))?;
					let top_tag = dom.tag_name(top).unwrap_or("");
					stack.pop();
					if top_tag.eq_ignore_ascii_case(&tag) {
						break;
					}
				}
				continue;
			}

			let (tag, attrs, self_closing, next) = parse_start_tag(html, i)?;
			i = next;

			let parent = *stack.last().ok_or_else(|| Error::Parse("missing parent element".into()))?;
			let node = dom.create_element(&tag, attrs);
			dom.append_child(parent, node);

			// Script bodies are raw text; no markup scanning inside.
			if tag.eq_ignore_ascii_case("script") {
				let close = find_case_insensitive_end_tag(bytes, i, b"script").ok_or_else(|| Error::Parse("unclosed <script>".into()))?;
				let body = &html[i..close];
				if !body.is_empty() {
					let text = dom.create_text(body);
					dom.append_child(node, text);
				}
				i = close;
				let (_, after_end) = parse_end_tag(html, i)?;
				i = after_end;
				continue;
			}

			if !self_closing && !is_void_tag(&tag) {
				stack.push(node);
			}
			continue;
		}

		let text_start = i;
		while i < bytes.len() && bytes[i] != b'<' {
			i += 1;
		}
		let text = &html[text_start..i];
		if !text.is_empty() {
			let parent = *stack.last().ok_or_else(|| Error::Parse("missing parent element".into()))?;
			let node = dom.create_text(&decode_character_references(text));
			dom.append_child(parent, node);
		}
	}

	Ok(fragment)
}

fn parse_start_tag(html: &str, at: usize) -> Result<(String, Vec<(String, String)>, bool, usize), Error> {
	let bytes = html.as_bytes();
	let mut i = at + 1;

	skip_ws(bytes, &mut i);
	let tag_start = i;
	while i < bytes.len() && is_tag_char(bytes[i]) {
		i += 1;
	}
	let tag = html[tag_start..i].to_ascii_lowercase();
	if tag.is_empty() {
		return Err(Error::Parse("empty tag name".into()));
	}

	let mut attrs = Vec::new();
	let mut self_closing = false;

	loop {
		skip_ws(bytes, &mut i);
		if i >= bytes.len() {
			return Err(Error::Parse(format!("unclosed start tag <{tag}>")));
		}

		if bytes[i] == b'>' {
			i += 1;
			break;
		}
		if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'>') {
			self_closing = true;
			i += 2;
			break;
		}

		let name_start = i;
		while i < bytes.len() && is_attr_name_char(bytes[i]) {
			i += 1;
		}
		let name = html[name_start..i].to_ascii_lowercase();
		if name.is_empty() {
			return Err(Error::Parse(format!("invalid attribute in <{tag}>")));
		}

		skip_ws(bytes, &mut i);
		let value = if i < bytes.len() && bytes[i] == b'=' {
			i += 1;
			skip_ws(bytes, &mut i);
			parse_attr_value(html, bytes, &mut i)?
		} else {
			// Boolean attribute.
			String::new()
		};

		attrs.push((name, value));
	}

	Ok((tag, attrs, self_closing, i))
}

fn parse_end_tag(html: &str, at: usize) -> Result<(String, usize), Error> {
	let bytes = html.as_bytes();
	let mut i = at + 2;
	skip_ws(bytes, &mut i);

	let tag_start = i;
	while i < bytes.len() && is_tag_char(bytes[i]) {
		i += 1;
	}
	let tag = html[tag_start..i].to_ascii_lowercase();

	while i < bytes.len() && bytes[i] != b'>' {
		i += 1;
	}
	if i >= bytes.len() {
		return Err(Error::Parse("unclosed end tag".into()));
	}
	Ok((tag, i + 1))
}

fn parse_attr_value(html: &str, bytes: &[u8], i: &mut usize) -> Result<String, Error> {
	if *i >= bytes.len() {
		return Err(Error::Parse("missing attribute value".into()));
	}

	if bytes[*i] == b'\'' || bytes[*i] == b'"' {
		let quote = bytes[*i];
		*i += 1;
		let start = *i;
		while *i < bytes.len() && bytes[*i] != quote {
			*i += 1;
		}
		if *i >= bytes.len() {
			return Err(Error::Parse("unclosed quoted attribute value".into()));
		}
		let value = &html[start..*i];
		*i += 1;
		return Ok(decode_character_references(value));
	}

	let start = *i;
	while *i < bytes.len() && !bytes[*i].is_ascii_whitespace() && bytes[*i] != b'>' && !(bytes[*i] == b'/' && bytes.get(*i + 1) == Some(&b'>')) {
		*i += 1;
	}
	Ok(decode_character_references(&html[start..*i]))
}

fn decode_character_references(text: &str) -> String {
	if !text.contains('&') {
		return text.to_string();
	}
	let mut out = String::with_capacity(text.len());
	let mut rest = text;
	while let Some(amp) = rest.find('&') {
		out.push_str(&rest[..amp]);
		rest = &rest[amp..];
		let Some(semi) = rest.as_bytes().iter().take(16).position(|&b| b == b';') else {
			out.push('&');
			rest = &rest[1..];
			continue;
		};
		let entity = &rest[1..semi];
		let decoded = match entity {
			"amp" => Some('&'),
			"lt" => Some('<'),
			"gt" => Some('>'),
			"quot" => Some('"'),
			"apos" => Some('\''),
			_ => entity
				.strip_prefix("#x")
				.or_else(|| entity.strip_prefix("#X"))
				.and_then(|hex| u32::from_str_radix(hex, 16).ok())
				.or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
				.and_then(char::from_u32),
		};
		match decoded {
			Some(c) => {
				out.push(c);
				rest = &rest[semi + 1..];
			}
			None => {
				out.push('&');
				rest = &rest[1..];
			}
		}
	}
	out.push_str(rest);
	out
}

fn skip_ws(bytes: &[u8], i: &mut usize) {
	while *i < bytes.len() && bytes[*i].is_ascii_whitespace() {
		*i += 1;
	}
}

fn is_tag_char(b: u8) -> bool {
	b.is_ascii_alphanumeric() || b == b'-' || b == b'_'
}

fn is_attr_name_char(b: u8) -> bool {
	b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b':'
}

fn starts_with_at(bytes: &[u8], at: usize, needle: &[u8]) -> bool {
	bytes.len() >= at + needle.len() && &bytes[at..at + needle.len()] == needle
}

fn find_subslice(bytes: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
	(from..=bytes.len().checked_sub(needle.len())?).find(|&i| &bytes[i..i + needle.len()] == needle)
}

fn find_case_insensitive_end_tag(bytes: &[u8], from: usize, tag: &[u8]) -> Option<usize> {
	let mut i = from;
	while i + tag.len() + 2 <= bytes.len() {
		if bytes[i] == b'<' && bytes[i + 1] == b'/' && bytes[i + 2..i + 2 + tag.len()].eq_ignore_ascii_case(tag) {
			return Some(i);
		}
		i += 1;
	}
	None
}
