// Jackson Coxson

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use num_bigint::BigInt;

use super::{Dictionary, Integer, PlistError, PlistValue};

const XML_DECLARATION: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>";
const DOCTYPE: &str = "<!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">";

pub fn create_xml(value: &PlistValue) -> String {
    let mut out = String::new();
    out.push_str(XML_DECLARATION);
    out.push('\n');
    out.push_str(DOCTYPE);
    out.push('\n');
    out.push_str("<plist version=\"1.0\">\n");
    write_value(value, 0, &mut out);
    out.push_str("</plist>\n");
    out
}

fn indent(depth: usize, out: &mut String) {
    for _ in 0..depth {
        out.push('\t');
    }
}

fn write_value(value: &PlistValue, depth: usize, out: &mut String) {
    indent(depth, out);
    match value {
        // The plist DTD has no null element; an empty string is the closest
        // representation the XML form can carry.
        PlistValue::Null => out.push_str("<string/>\n"),
        PlistValue::Boolean(true) => out.push_str("<true/>\n"),
        PlistValue::Boolean(false) => out.push_str("<false/>\n"),
        PlistValue::Integer(i) => {
            out.push_str("<integer>");
            out.push_str(&i.to_string());
            out.push_str("</integer>\n");
        }
        PlistValue::Real(r) => {
            out.push_str("<real>");
            out.push_str(&r.to_string());
            out.push_str("</real>\n");
        }
        PlistValue::Date(d) => {
            out.push_str("<date>");
            out.push_str(&d.to_rfc3339_opts(SecondsFormat::Secs, true));
            out.push_str("</date>\n");
        }
        PlistValue::Data(d) => {
            out.push_str("<data>");
            out.push_str(&B64.encode(d));
            out.push_str("</data>\n");
        }
        PlistValue::String(s) => {
            out.push_str("<string>");
            escape_into(s, out);
            out.push_str("</string>\n");
        }
        PlistValue::Array(items) => {
            if items.is_empty() {
                out.push_str("<array/>\n");
            } else {
                out.push_str("<array>\n");
                for item in items {
                    write_value(item, depth + 1, out);
                }
                indent(depth, out);
                out.push_str("</array>\n");
            }
        }
        PlistValue::Dictionary(dict) => {
            if dict.is_empty() {
                out.push_str("<dict/>\n");
            } else {
                out.push_str("<dict>\n");
                for (key, value) in dict {
                    indent(depth + 1, out);
                    out.push_str("<key>");
                    escape_into(key, out);
                    out.push_str("</key>\n");
                    write_value(value, depth + 1, out);
                }
                indent(depth, out);
                out.push_str("</dict>\n");
            }
        }
        PlistValue::Uid(u) => {
            // NSKeyedArchiver's XML convention for object references
            out.push_str("<dict>\n");
            indent(depth + 1, out);
            out.push_str("<key>CF$UID</key>\n");
            indent(depth + 1, out);
            out.push_str("<integer>");
            out.push_str(&u.to_string());
            out.push_str("</integer>\n");
            indent(depth, out);
            out.push_str("</dict>\n");
        }
    }
}

fn escape_into(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
}

pub fn parse_xml(input: &str) -> Result<PlistValue, PlistError> {
    let cleaned = cleanup(input);
    if cleaned.trim().is_empty() {
        return Err(PlistError::EmptyDocument);
    }

    let mut cursor = Cursor::new(&cleaned);
    cursor.skip_misc();
    if cursor.at_end() {
        return Err(PlistError::EmptyDocument);
    }
    if !cursor.starts_with("<") {
        return Err(PlistError::NoRootElement);
    }

    let root = cursor.read_tag()?;
    if root.name != "plist" {
        return Err(PlistError::RootNotPlist);
    }
    if root.self_closing {
        return Err(PlistError::EmptyDocument);
    }

    cursor.skip_misc();
    let value = parse_value(&mut cursor)?;
    cursor.skip_misc();
    cursor.expect_close("plist")?;
    Ok(value)
}

/// Applies the three recovery rules for hostile-but-common inputs:
/// leading garbage before the declaration, duplicate declarations, and
/// stray U+FFFD replacement characters outside the document proper.
fn cleanup(input: &str) -> String {
    // Strip a UTF-8 BOM first so the declaration scan sees the real start
    let input = input.strip_prefix('\u{FEFF}').unwrap_or(input);

    // Leading garbage: trim to the first <?xml
    let mut s = match input.find("<?xml") {
        Some(pos) if pos > 0 => input[pos..].to_string(),
        _ => input.to_string(),
    };

    // Multiple declarations: keep the first, delete the rest
    if let Some(first) = s.find("<?xml") {
        let after_first = first + "<?xml".len();
        loop {
            let Some(rel) = s[after_first..].find("<?xml") else {
                break;
            };
            let start = after_first + rel;
            match s[start..].find("?>") {
                Some(end_rel) => {
                    s.replace_range(start..start + end_rel + 2, "");
                }
                None => {
                    s.truncate(start);
                    break;
                }
            }
        }
    }

    if !s.contains('\u{FFFD}') {
        return s;
    }

    // U+FFFD before any tag: drop the prefix up to the first <
    match s.find('<') {
        Some(first_lt) => {
            if s[..first_lt].contains('\u{FFFD}') {
                s.replace_range(..first_lt, "");
            }
        }
        // No tags at all; nothing is recoverable
        None => return String::new(),
    }

    // U+FFFD after the last tag: drop the suffix from the last >
    if let Some(last_gt) = s.rfind('>') {
        if s[last_gt + 1..].contains('\u{FFFD}') {
            s.truncate(last_gt + 1);
        }
    }

    // U+FFFD between two tags: drop the character, but only when nothing
    // except whitespace separates the surrounding tags. Replacement
    // characters inside element text are left alone.
    let mut result = String::with_capacity(s.len());
    let chars: Vec<char> = s.chars().collect();
    for (i, c) in chars.iter().enumerate() {
        if *c == '\u{FFFD}' {
            let before_ok = chars[..i]
                .iter()
                .rev()
                .skip_while(|c| c.is_whitespace() || **c == '\u{FFFD}')
                .next()
                == Some(&'>');
            let after_ok = chars[i + 1..]
                .iter()
                .skip_while(|c| c.is_whitespace() || **c == '\u{FFFD}')
                .next()
                == Some(&'<');
            if before_ok && after_ok {
                continue;
            }
        }
        result.push(*c);
    }
    result
}

struct Tag<'a> {
    name: &'a str,
    self_closing: bool,
}

struct Cursor<'a> {
    s: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(s: &'a str) -> Self {
        Self { s, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.s[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.s.len()
    }

    fn starts_with(&self, prefix: &str) -> bool {
        self.rest().starts_with(prefix)
    }

    fn advance(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.s.len());
    }

    fn skip_whitespace(&mut self) {
        let rest = self.rest();
        let trimmed = rest.trim_start();
        self.pos += rest.len() - trimmed.len();
    }

    /// Skips whitespace, comments, processing instructions and DOCTYPE
    fn skip_misc(&mut self) {
        loop {
            self.skip_whitespace();
            if self.starts_with("<!--") {
                match self.rest().find("-->") {
                    Some(end) => self.advance(end + 3),
                    None => {
                        self.pos = self.s.len();
                        return;
                    }
                }
            } else if self.starts_with("<?") {
                match self.rest().find("?>") {
                    Some(end) => self.advance(end + 2),
                    None => {
                        self.pos = self.s.len();
                        return;
                    }
                }
            } else if self.starts_with("<!") {
                match self.rest().find('>') {
                    Some(end) => self.advance(end + 1),
                    None => {
                        self.pos = self.s.len();
                        return;
                    }
                }
            } else {
                return;
            }
        }
    }

    /// Reads an opening tag, returning its name and whether it self-closes
    fn read_tag(&mut self) -> Result<Tag<'a>, PlistError> {
        if !self.starts_with("<") {
            return Err(PlistError::UnexpectedEof);
        }
        self.advance(1);
        let rest = self.rest();
        let name_len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '$'))
            .unwrap_or(rest.len());
        let name = &rest[..name_len];
        if name.is_empty() {
            return Err(PlistError::UnexpectedElement(String::new()));
        }
        self.advance(name_len);
        match self.rest().find('>') {
            Some(end) => {
                let self_closing = self.rest()[..end].trim_end().ends_with('/');
                self.advance(end + 1);
                Ok(Tag { name, self_closing })
            }
            None => Err(PlistError::UnclosedTag(name.to_string())),
        }
    }

    fn expect_close(&mut self, name: &str) -> Result<(), PlistError> {
        let marker = format!("</{name}");
        if !self.starts_with(&marker) {
            return Err(PlistError::UnclosedTag(name.to_string()));
        }
        self.advance(marker.len());
        match self.rest().find('>') {
            Some(end) => {
                self.advance(end + 1);
                Ok(())
            }
            None => Err(PlistError::UnclosedTag(name.to_string())),
        }
    }

    /// Reads text content up to `</name>`, decoding entities and CDATA
    fn read_text(&mut self, name: &str) -> Result<String, PlistError> {
        let close = format!("</{name}");
        let mut text = String::new();
        loop {
            let rest = self.rest();
            let lt = match rest.find('<') {
                Some(i) => i,
                None => return Err(PlistError::UnclosedTag(name.to_string())),
            };
            decode_entities(&rest[..lt], &mut text)?;
            self.advance(lt);
            if self.starts_with("<![CDATA[") {
                self.advance("<![CDATA[".len());
                match self.rest().find("]]>") {
                    Some(end) => {
                        text.push_str(&self.rest()[..end]);
                        self.advance(end + 3);
                    }
                    None => return Err(PlistError::UnclosedTag(name.to_string())),
                }
            } else if self.starts_with(&close) {
                self.expect_close(name)?;
                return Ok(text);
            } else {
                return Err(PlistError::UnexpectedElement(name.to_string()));
            }
        }
    }
}

fn decode_entities(input: &str, out: &mut String) -> Result<(), PlistError> {
    let mut rest = input;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let semi = rest.find(';').ok_or(PlistError::BadEntity)?;
        let entity = &rest[1..semi];
        match entity {
            "amp" => out.push('&'),
            "lt" => out.push('<'),
            "gt" => out.push('>'),
            "quot" => out.push('"'),
            "apos" => out.push('\''),
            _ => {
                let code = if let Some(hex) = entity.strip_prefix("#x") {
                    u32::from_str_radix(hex, 16).map_err(|_| PlistError::BadEntity)?
                } else if let Some(dec) = entity.strip_prefix('#') {
                    dec.parse::<u32>().map_err(|_| PlistError::BadEntity)?
                } else {
                    return Err(PlistError::BadEntity);
                };
                out.push(char::from_u32(code).ok_or(PlistError::BadEntity)?);
            }
        }
        rest = &rest[semi + 1..];
    }
    out.push_str(rest);
    Ok(())
}

fn parse_value(cursor: &mut Cursor) -> Result<PlistValue, PlistError> {
    cursor.skip_misc();
    if !cursor.starts_with("<") {
        return Err(PlistError::UnexpectedEof);
    }
    let tag = cursor.read_tag()?;
    match tag.name {
        "dict" => {
            let mut dict = Dictionary::new();
            if tag.self_closing {
                return Ok(PlistValue::Dictionary(dict));
            }
            loop {
                cursor.skip_misc();
                if cursor.starts_with("</dict") {
                    cursor.expect_close("dict")?;
                    return Ok(PlistValue::Dictionary(dict));
                }
                if cursor.at_end() {
                    return Err(PlistError::UnclosedTag("dict".to_string()));
                }
                let key_tag = cursor.read_tag()?;
                if key_tag.name != "key" {
                    return Err(PlistError::UnexpectedElement(key_tag.name.to_string()));
                }
                let key = if key_tag.self_closing {
                    String::new()
                } else {
                    cursor.read_text("key")?
                };
                let value = parse_value(cursor)?;
                dict.insert(key, value);
            }
        }
        "array" => {
            let mut items = Vec::new();
            if tag.self_closing {
                return Ok(PlistValue::Array(items));
            }
            loop {
                cursor.skip_misc();
                if cursor.starts_with("</array") {
                    cursor.expect_close("array")?;
                    return Ok(PlistValue::Array(items));
                }
                if cursor.at_end() {
                    return Err(PlistError::UnclosedTag("array".to_string()));
                }
                items.push(parse_value(cursor)?);
            }
        }
        "string" => {
            if tag.self_closing {
                return Ok(PlistValue::String(String::new()));
            }
            Ok(PlistValue::String(cursor.read_text("string")?))
        }
        "integer" => {
            if tag.self_closing {
                return Err(PlistError::BadInteger);
            }
            let text = cursor.read_text("integer")?;
            let text = text.trim();
            match text.parse::<i64>() {
                Ok(i) => Ok(PlistValue::Integer(Integer::from(i))),
                Err(_) => match text.parse::<BigInt>() {
                    Ok(b) => Ok(PlistValue::Integer(Integer::from(b))),
                    Err(_) => Err(PlistError::BadInteger),
                },
            }
        }
        "real" => {
            if tag.self_closing {
                return Err(PlistError::BadReal);
            }
            let text = cursor.read_text("real")?;
            text.trim()
                .parse::<f64>()
                .map(PlistValue::Real)
                .map_err(|_| PlistError::BadReal)
        }
        "true" => {
            if !tag.self_closing {
                cursor.expect_close("true")?;
            }
            Ok(PlistValue::Boolean(true))
        }
        "false" => {
            if !tag.self_closing {
                cursor.expect_close("false")?;
            }
            Ok(PlistValue::Boolean(false))
        }
        "data" => {
            if tag.self_closing {
                return Ok(PlistValue::Data(Vec::new()));
            }
            let text = cursor.read_text("data")?;
            let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
            B64.decode(compact.as_bytes())
                .map(PlistValue::Data)
                .map_err(|_| PlistError::BadBase64)
        }
        "date" => {
            if tag.self_closing {
                return Err(PlistError::BadDate);
            }
            let text = cursor.read_text("date")?;
            DateTime::parse_from_rfc3339(text.trim())
                .map(|d| PlistValue::Date(d.with_timezone(&Utc)))
                .map_err(|_| PlistError::BadDate)
        }
        other => Err(PlistError::UnexpectedElement(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<plist version=\"1.0\"><dict><key>x</key><integer>42</integer></dict></plist>";

    fn x_is_42(v: &PlistValue) {
        assert_eq!(
            v.as_dictionary()
                .and_then(|d| d.get("x"))
                .and_then(|x| x.as_signed_integer()),
            Some(42)
        );
    }

    #[test]
    fn parses_simple_dict() {
        x_is_42(&parse_xml(SIMPLE).unwrap());
    }

    #[test]
    fn leading_replacement_char() {
        let input = format!("\u{FFFD}{SIMPLE}");
        x_is_42(&parse_xml(&input).unwrap());
    }

    #[test]
    fn trailing_replacement_char() {
        let input = format!("{SIMPLE}\u{FFFD}\u{FFFD}");
        x_is_42(&parse_xml(&input).unwrap());
    }

    #[test]
    fn replacement_char_between_tags() {
        let input = SIMPLE.replace("</key><integer>", "</key>\u{FFFD}<integer>");
        x_is_42(&parse_xml(&input).unwrap());
    }

    #[test]
    fn replacement_char_in_text_is_kept() {
        let input = "<plist version=\"1.0\"><string>a\u{FFFD}b</string></plist>";
        let v = parse_xml(input).unwrap();
        assert_eq!(v.as_string(), Some("a\u{FFFD}b"));
    }

    #[test]
    fn leading_garbage_before_declaration() {
        let input = format!("\x02\x05binary junk here{SIMPLE}");
        x_is_42(&parse_xml(&input).unwrap());
    }

    #[test]
    fn duplicate_declarations() {
        let dup = SIMPLE.replace(
            "<plist",
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?><plist",
        );
        x_is_42(&parse_xml(&dup).unwrap());
    }

    #[test]
    fn all_three_cleanups_combined() {
        let dup = SIMPLE.replace(
            "<plist",
            "<?xml version=\"1.0\"?><plist",
        );
        let input = format!("garbage\u{FFFD}{dup}\u{FFFD}");
        x_is_42(&parse_xml(&input).unwrap());
    }

    #[test]
    fn comments_cdata_and_doctype() {
        let input = "<?xml version=\"1.0\"?>\n<!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n<!-- hello -->\n<plist version=\"1.0\"><!-- inner --><string><![CDATA[a<b&c]]></string></plist>";
        let v = parse_xml(input).unwrap();
        assert_eq!(v.as_string(), Some("a<b&c"));
    }

    #[test]
    fn escaped_entities_round_trip() {
        let v = PlistValue::String("a & b < c > \"d\" 'e'".to_string());
        let xml = create_xml(&v);
        assert_eq!(parse_xml(&xml).unwrap(), v);
    }

    #[test]
    fn rejects_empty_document() {
        assert!(matches!(parse_xml(""), Err(PlistError::EmptyDocument)));
        assert!(matches!(
            parse_xml("\u{FFFD}\u{FFFD}"),
            Err(PlistError::EmptyDocument)
        ));
    }

    #[test]
    fn rejects_non_plist_root() {
        assert!(matches!(
            parse_xml("<html><body/></html>"),
            Err(PlistError::RootNotPlist)
        ));
    }

    #[test]
    fn rejects_missing_root() {
        assert!(matches!(
            parse_xml("just some text"),
            Err(PlistError::NoRootElement)
        ));
    }

    #[test]
    fn rejects_unclosed_tag() {
        let input = "<plist version=\"1.0\"><dict><key>x</key><integer>42</integer>";
        assert!(matches!(
            parse_xml(input),
            Err(PlistError::UnclosedTag(_))
        ));
    }
}
