//! `index.html` for production output.

/// Rewrite a page for production: drop the dev `<script>` tags that point at
/// entry modules, then add the stylesheet and chunk tags before `</head>`.
#[must_use]
pub fn production_html(
    template: &str,
    entry_urls: &[String],
    styles: &[String],
    scripts: &[String],
) -> String {
    let mut html = remove_entry_scripts(template, entry_urls);

    let mut tags = String::new();
    for href in styles {
        tags.push_str(&format!("    <link rel=\"stylesheet\" href=\"{href}\" />\n"));
    }
    for src in scripts {
        tags.push_str(&format!("    <script defer src=\"{src}\"></script>\n"));
    }
    if tags.is_empty() {
        return html;
    }

    if let Some(pos) = html.find("</head>") {
        html.insert_str(pos, &format!("{}  ", tags.trim_start()));
    } else if let Some(pos) = html.find("</body>") {
        html.insert_str(pos, &tags);
    } else {
        html.push('\n');
        html.push_str(&tags);
    }
    html
}

fn remove_entry_scripts(html: &str, entry_urls: &[String]) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;
    while let Some(start) = rest.find("<script") {
        let Some(close) = rest[start..].find("</script>").map(|n| start + n + "</script>".len()) else {
            break;
        };
        let tag = &rest[start..close];
        let is_entry = script_src(tag).is_some_and(|src| {
            let src = normalize(src);
            entry_urls.iter().any(|url| *url == src)
        });
        if is_entry {
            out.push_str(rest[..start].trim_end_matches([' ', '\t']));
            rest = rest[close..].strip_prefix('\n').unwrap_or(&rest[close..]);
        } else {
            out.push_str(&rest[..close]);
            rest = &rest[close..];
        }
    }
    out.push_str(rest);
    out
}

fn script_src(tag: &str) -> Option<&str> {
    let head = &tag[..tag.find('>')?];
    let at = head.find("src=")? + "src=".len();
    let value = &head[at..];
    let quote = value.chars().next()?;
    if quote == '"' || quote == '\'' {
        let end = value[1..].find(quote)? + 1;
        Some(&value[1..end])
    } else {
        let end = value.find(|c: char| c.is_whitespace()).unwrap_or(value.len());
        Some(&value[..end])
    }
}

/// `./src/main.js` and `src/main.js` both mean `/src/main.js`.
fn normalize(src: &str) -> String {
    let trimmed = src.trim_start_matches("./");
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = "<!DOCTYPE html>\n<html>\n  <head>\n    <title>app</title>\n  </head>\n  <body>\n    <div id=\"root\"></div>\n    <script type=\"module\" src=\"./src/main.js\"></script>\n    <script src=\"/analytics.js\"></script>\n  </body>\n</html>\n";

    #[test]
    fn test_replaces_dev_entry_script() {
        let html = production_html(
            PAGE,
            &["/src/main.js".to_string()],
            &["/assets/style-1.css".to_string()],
            &["/assets/nexus-runtime-2.js".to_string(), "/assets/main-3.js".to_string()],
        );
        assert!(!html.contains("src/main.js"));
        assert!(html.contains("/analytics.js"));
        let head_end = html.find("</head>").unwrap();
        let link = html.find("<link rel=\"stylesheet\" href=\"/assets/style-1.css\" />").unwrap();
        let runtime = html.find("/assets/nexus-runtime-2.js").unwrap();
        let main = html.find("<script defer src=\"/assets/main-3.js\"></script>").unwrap();
        assert!(link < runtime && runtime < main && main < head_end);
    }

    #[test]
    fn test_page_without_head() {
        let html = production_html("<p>hi</p>", &[], &[], &["/a.js".to_string()]);
        assert!(html.ends_with("<script defer src=\"/a.js\"></script>\n"));
    }

    #[test]
    fn test_script_src_forms() {
        assert_eq!(script_src("<script src='/a.js'></script>"), Some("/a.js"));
        assert_eq!(script_src("<script type=module src=/b.js></script>"), Some("/b.js"));
        assert_eq!(script_src("<script>inline()</script>"), None);
    }
}
