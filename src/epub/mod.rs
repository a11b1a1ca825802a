//! EPUB writer. Splits a [NovelJob] into volumes and writes each as an EPUB 3 file
//! (mimetype, container, OPF, nav/NCX, front page, chapters).

use crate::model::{ChapterResult, NovelJob, NovelMetadata};
use std::io::{Seek, Write};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Chapters per volume unless configured otherwise.
pub const DEFAULT_CHAPTERS_PER_BOOK: usize = 500;

const CONTAINER_XML: &[u8] = b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<container version=\"1.0\" xmlns=\"urn:oasis:names:tc:opendocument:xmlns:container\">\n  <rootfiles>\n    <rootfile full-path=\"OEBPS/content.opf\" media-type=\"application/oebps-package+xml\"/>\n  </rootfiles>\n</container>";

const MIMETYPE: &[u8] = b"application/epub+zip";
const OEBPS_PREFIX: &str = "OEBPS/";

/// Errors from the EPUB writer. The CLI maps these to exit code 3.
#[derive(Debug, Error)]
pub enum EpubError {
    #[error("Cannot write EPUB: no chapters were collected.")]
    NoChapters,

    #[error("Cannot create output directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create EPUB file: {path}: {source}")]
    CreateFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write EPUB archive: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl From<std::io::Error> for EpubError {
    fn from(e: std::io::Error) -> Self {
        EpubError::Zip(zip::result::ZipError::Io(e))
    }
}

/// Inclusive 1-based chapter positions for each volume. `per_book == 0` means one volume.
pub fn plan_volumes(total: usize, per_book: usize) -> Vec<RangeInclusive<usize>> {
    if total == 0 {
        return Vec::new();
    }
    let per_book = if per_book == 0 { total } else { per_book };
    (0..total.div_ceil(per_book))
        .map(|v| {
            let first = v * per_book + 1;
            first..=(first + per_book - 1).min(total)
        })
        .collect()
}

/// Lower-case roman numeral, used as the volume suffix.
pub fn roman(mut n: usize) -> String {
    const NUMERALS: [(usize, &str); 13] = [
        (1000, "m"),
        (900, "cm"),
        (500, "d"),
        (400, "cd"),
        (100, "c"),
        (90, "xc"),
        (50, "l"),
        (40, "xl"),
        (10, "x"),
        (9, "ix"),
        (5, "v"),
        (4, "iv"),
        (1, "i"),
    ];
    let mut out = String::new();
    for (value, numeral) in NUMERALS {
        while n >= value {
            out.push_str(numeral);
            n -= value;
        }
    }
    out
}

/// File-name stem for a title: lower-case, anything but letters and digits becomes `_`.
pub fn slug(title: &str) -> String {
    let mut out = String::new();
    for c in title.trim().chars().flat_map(char::to_lowercase) {
        if c.is_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let out = out.trim_matches('_').to_string();
    if out.is_empty() {
        "untitled".to_string()
    } else {
        out
    }
}

/// Image format sniffed from the leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoverKind {
    Jpeg,
    Png,
    Gif,
    Webp,
}

impl CoverKind {
    fn sniff(data: &[u8]) -> Self {
        if data.starts_with(b"\x89PNG") {
            CoverKind::Png
        } else if data.starts_with(b"GIF8") {
            CoverKind::Gif
        } else if data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WEBP" {
            CoverKind::Webp
        } else {
            CoverKind::Jpeg
        }
    }

    fn ext(self) -> &'static str {
        match self {
            CoverKind::Jpeg => "jpg",
            CoverKind::Png => "png",
            CoverKind::Gif => "gif",
            CoverKind::Webp => "webp",
        }
    }

    fn media_type(self) -> &'static str {
        match self {
            CoverKind::Jpeg => "image/jpeg",
            CoverKind::Png => "image/png",
            CoverKind::Gif => "image/gif",
            CoverKind::Webp => "image/webp",
        }
    }
}

/// One volume being written.
struct Volume<'a> {
    metadata: &'a NovelMetadata,
    number: usize,
    total_volumes: usize,
    chapters: &'a [ChapterResult],
    cover: Option<(&'a [u8], CoverKind)>,
}

impl Volume<'_> {
    fn title(&self) -> String {
        if self.total_volumes > 1 {
            format!("{} ({})", self.metadata.title, roman(self.number).to_uppercase())
        } else {
            self.metadata.title.clone()
        }
    }

    fn identifier(&self) -> String {
        let base = if self.metadata.source_url.is_empty() {
            "urn:novelscrape:book"
        } else {
            self.metadata.source_url.as_str()
        };
        format!("{}#volume-{}", base, self.number)
    }

    fn author(&self) -> &str {
        if self.metadata.author.trim().is_empty() {
            "Unknown"
        } else {
            &self.metadata.author
        }
    }
}

/// Write the job's chapters as one or more EPUB files in `out_dir`.
///
/// Returns the written paths in volume order. The cover, when given, goes on every
/// volume's front page.
pub fn write_volumes(
    job: &NovelJob,
    cover: Option<&[u8]>,
    per_book: usize,
    out_dir: &Path,
) -> Result<Vec<PathBuf>, EpubError> {
    if job.chapters.is_empty() {
        return Err(EpubError::NoChapters);
    }
    std::fs::create_dir_all(out_dir).map_err(|e| EpubError::CreateDir {
        path: out_dir.to_path_buf(),
        source: e,
    })?;

    let cover = cover
        .filter(|c| !c.is_empty())
        .map(|c| (c, CoverKind::sniff(c)));
    let plan = plan_volumes(job.chapters.len(), per_book);
    let stem = slug(&job.metadata.title);
    let mut written = Vec::with_capacity(plan.len());

    for (i, range) in plan.iter().enumerate() {
        let volume = Volume {
            metadata: &job.metadata,
            number: i + 1,
            total_volumes: plan.len(),
            chapters: &job.chapters[range.start() - 1..*range.end()],
            cover,
        };
        let path = out_dir.join(format!("{}-{}.epub", stem, roman(i + 1)));
        let file = std::fs::File::create(&path).map_err(|e| EpubError::CreateFile {
            path: path.clone(),
            source: e,
        })?;
        write_volume(&volume, file)?;
        info!(path = %path.display(), chapters = volume.chapters.len(), "EPUB written");
        written.push(path);
    }
    Ok(written)
}

fn write_volume(volume: &Volume<'_>, out: impl Write + Seek) -> Result<(), EpubError> {
    let mut zip = ZipWriter::new(out);

    let options_stored = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .unix_permissions(0o644);
    let options_deflate = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    // Mimetype first and uncompressed.
    zip.start_file("mimetype", options_stored)?;
    zip.write_all(MIMETYPE)?;

    zip.start_file("META-INF/container.xml", options_deflate)?;
    zip.write_all(CONTAINER_XML)?;

    write_opf(volume, &mut zip, options_deflate)?;
    write_nav_xhtml(volume, &mut zip, options_deflate)?;
    write_ncx(volume, &mut zip, options_deflate)?;
    write_front_xhtml(volume, &mut zip, options_deflate)?;
    write_chapters(volume, &mut zip, options_deflate)?;

    if let Some((data, kind)) = volume.cover {
        zip.start_file(
            format!("{}images/cover.{}", OEBPS_PREFIX, kind.ext()),
            options_deflate,
        )?;
        zip.write_all(data)?;
    }

    zip.finish()?;
    Ok(())
}

fn chapter_file(position: usize) -> String {
    format!("chapter-{}.xhtml", position)
}

fn write_opf(
    volume: &Volume<'_>,
    zip: &mut ZipWriter<impl Write + Seek>,
    options: SimpleFileOptions,
) -> Result<(), EpubError> {
    let meta = volume.metadata;
    let mut metadata_els = vec![
        format!(
            r#"<dc:identifier id="book-id">{}</dc:identifier>"#,
            xml_escape(&volume.identifier())
        ),
        format!("<dc:title>{}</dc:title>", xml_escape(&volume.title())),
        format!("<dc:creator>{}</dc:creator>", xml_escape(volume.author())),
        format!(
            "<dc:language>{}</dc:language>",
            xml_escape(meta.language.as_deref().unwrap_or("en"))
        ),
    ];
    if let Some(synopsis) = meta.synopsis.as_deref().filter(|s| !s.trim().is_empty()) {
        metadata_els.push(format!(
            "<dc:description>{}</dc:description>",
            xml_escape(synopsis)
        ));
    }
    for genre in &meta.genres {
        metadata_els.push(format!("<dc:subject>{}</dc:subject>", xml_escape(genre)));
    }
    if volume.total_volumes > 1 {
        metadata_els.push(format!(
            r#"<meta property="belongs-to-collection" id="series">{}</meta>"#,
            xml_escape(&meta.title)
        ));
        metadata_els.push(format!(
            r##"<meta refines="#series" property="group-position">{}</meta>"##,
            volume.number
        ));
    }
    if volume.cover.is_some() {
        metadata_els.push(r#"<meta name="cover" content="cover-img"/>"#.to_string());
    }

    let mut manifest = String::from(
        r#"    <item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
    <item id="ncx" href="toc.ncx" media-type="application/x-dtbncx+xml"/>
    <item id="front" href="front.xhtml" media-type="application/xhtml+xml"/>
"#,
    );
    if let Some((_, kind)) = volume.cover {
        manifest.push_str(&format!(
            "    <item id=\"cover-img\" href=\"images/cover.{}\" media-type=\"{}\" properties=\"cover-image\"/>\n",
            kind.ext(),
            kind.media_type()
        ));
    }
    let mut spine = String::from("    <itemref idref=\"front\"/>\n");
    for position in 1..=volume.chapters.len() {
        manifest.push_str(&format!(
            "    <item id=\"chapter-{}\" href=\"{}\" media-type=\"application/xhtml+xml\"/>\n",
            position,
            chapter_file(position)
        ));
        spine.push_str(&format!("    <itemref idref=\"chapter-{}\"/>\n", position));
    }

    let opf = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" unique-identifier="book-id" version="3.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    {metadata}
  </metadata>
  <manifest>
{manifest}  </manifest>
  <spine toc="ncx">
{spine}  </spine>
</package>
"#,
        metadata = metadata_els.join("\n    "),
        manifest = manifest,
        spine = spine,
    );

    zip.start_file(format!("{}content.opf", OEBPS_PREFIX), options)?;
    zip.write_all(opf.as_bytes())?;
    Ok(())
}

fn write_nav_xhtml(
    volume: &Volume<'_>,
    zip: &mut ZipWriter<impl Write + Seek>,
    options: SimpleFileOptions,
) -> Result<(), EpubError> {
    let mut links = String::from("      <li><a href=\"front.xhtml\">Front Page</a></li>\n");
    for (i, ch) in volume.chapters.iter().enumerate() {
        links.push_str(&format!(
            "      <li><a href=\"{}\">{}</a></li>\n",
            chapter_file(i + 1),
            xml_escape(&ch.title)
        ));
    }
    let nav = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<head>
  <meta charset="UTF-8"/>
  <title>Table of Contents</title>
</head>
<body>
  <nav epub:type="toc">
    <h1>Contents</h1>
    <ol>
{}    </ol>
  </nav>
</body>
</html>
"#,
        links
    );
    zip.start_file(format!("{}nav.xhtml", OEBPS_PREFIX), options)?;
    zip.write_all(nav.as_bytes())?;
    Ok(())
}

fn write_ncx(
    volume: &Volume<'_>,
    zip: &mut ZipWriter<impl Write + Seek>,
    options: SimpleFileOptions,
) -> Result<(), EpubError> {
    let mut nav_points = String::new();
    let entries = std::iter::once(("Front Page", "front.xhtml".to_string())).chain(
        volume
            .chapters
            .iter()
            .enumerate()
            .map(|(i, ch)| (ch.title.as_str(), chapter_file(i + 1))),
    );
    for (order, (label, src)) in entries.enumerate() {
        nav_points.push_str(&format!(
            r#"    <navPoint id="navpoint-{order}" playOrder="{order}">
      <navLabel><text>{label}</text></navLabel>
      <content src="{src}"/>
    </navPoint>
"#,
            order = order + 1,
            label = xml_escape(label),
            src = src
        ));
    }
    let ncx = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
  <head>
    <meta name="dtb:uid" content="{}"/>
  </head>
  <docTitle>
    <text>{}</text>
  </docTitle>
  <navMap>
{}  </navMap>
</ncx>
"#,
        xml_escape(&volume.identifier()),
        xml_escape(&volume.title()),
        nav_points
    );
    zip.start_file(format!("{}toc.ncx", OEBPS_PREFIX), options)?;
    zip.write_all(ncx.as_bytes())?;
    Ok(())
}

/// Front page: cover image, title, author, status, language, genres and synopsis.
fn write_front_xhtml(
    volume: &Volume<'_>,
    zip: &mut ZipWriter<impl Write + Seek>,
    options: SimpleFileOptions,
) -> Result<(), EpubError> {
    let meta = volume.metadata;
    let mut body = String::new();
    if let Some((_, kind)) = volume.cover {
        body.push_str(&format!(
            "  <div class=\"cover\"><img src=\"images/cover.{}\" alt=\"Cover\" style=\"max-width: 100%; height: auto;\"/></div>\n",
            kind.ext()
        ));
    }
    body.push_str(&format!("  <h1>{}</h1>\n", xml_escape(&volume.title())));
    body.push_str(&format!("  <h2>by {}</h2>\n", xml_escape(volume.author())));

    let mut facts = Vec::new();
    if let Some(status) = meta.status.as_deref().filter(|s| !s.is_empty()) {
        facts.push(format!("<b>Status:</b> {}", xml_escape(status)));
    }
    if let Some(language) = meta.language.as_deref().filter(|s| !s.is_empty()) {
        facts.push(format!("<b>Language:</b> {}", xml_escape(language)));
    }
    if !facts.is_empty() {
        body.push_str(&format!("  <p class=\"meta\">{}</p>\n", facts.join(" | ")));
    }
    if !meta.genres.is_empty() {
        let genres: Vec<String> = meta.genres.iter().map(|g| xml_escape(g)).collect();
        body.push_str(&format!(
            "  <p class=\"genres\"><b>Genres:</b> {}</p>\n",
            genres.join(", ")
        ));
    }
    if let Some(synopsis) = meta.synopsis.as_deref().filter(|s| !s.trim().is_empty()) {
        body.push_str(&format!(
            "  <div class=\"synopsis\"><b>Synopsis:</b>\n{}  </div>\n",
            paragraphs_html(synopsis.lines())
        ));
    }

    let front = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml">
<head>
  <meta charset="UTF-8"/>
  <title>{}</title>
</head>
<body>
{}</body>
</html>
"#,
        xml_escape(&volume.title()),
        body
    );
    zip.start_file(format!("{}front.xhtml", OEBPS_PREFIX), options)?;
    zip.write_all(front.as_bytes())?;
    Ok(())
}

fn write_chapters(
    volume: &Volume<'_>,
    zip: &mut ZipWriter<impl Write + Seek>,
    options: SimpleFileOptions,
) -> Result<(), EpubError> {
    for (i, ch) in volume.chapters.iter().enumerate() {
        let title = if ch.title.trim().is_empty() {
            format!("Chapter {}", ch.index)
        } else {
            ch.title.clone()
        };
        let title = xml_escape(&title);
        let html = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml">
<head>
  <meta charset="UTF-8"/>
  <title>{title}</title>
</head>
<body>
  <h1>{title}</h1>
{body}</body>
</html>
"#,
            title = title,
            body = paragraphs_html(ch.paragraphs.iter().map(String::as_str))
        );
        zip.start_file(format!("{}{}", OEBPS_PREFIX, chapter_file(i + 1)), options)?;
        zip.write_all(html.as_bytes())?;
    }
    Ok(())
}

fn paragraphs_html<'s>(paragraphs: impl Iterator<Item = &'s str>) -> String {
    let mut out = String::new();
    for p in paragraphs.map(str::trim).filter(|p| !p.is_empty()) {
        out.push_str("  <p>");
        out.push_str(&xml_escape(p));
        out.push_str("</p>\n");
    }
    out
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
