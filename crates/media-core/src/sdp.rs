//! Line-oriented SDP helpers
//!
//! The negotiators in this stack deal with SDP as text: the legacy path
//! hand-builds its offer, the modern path only ever needs to clean up or
//! rewrite what the remote produced. These helpers keep that text handling
//! in one place. Input tolerates bare `\n`; output is always CRLF.

use crate::error::{Error, Result};

/// One `m=` section of an SDP document, with the lines that follow it
#[derive(Debug, Clone)]
pub struct MediaSection {
    /// Media kind from the m-line ("audio", "video", ...)
    pub kind: String,
    /// Transport port from the m-line
    pub port: u16,
    /// The m-line itself followed by every line up to the next m-line
    pub lines: Vec<String>,
}

impl MediaSection {
    /// Value of an `a=<name>:` attribute within this section, if present
    pub fn attribute(&self, name: &str) -> Option<&str> {
        attribute_in(&self.lines, name)
    }

    /// Rewrite the m-line port, leaving the rest of the line intact
    pub fn set_port(&mut self, port: u16) -> Result<()> {
        let m_line = self
            .lines
            .first()
            .cloned()
            .ok_or_else(|| Error::SdpParse("empty media section".into()))?;
        let mut parts: Vec<&str> = m_line.split(' ').collect();
        if parts.len() < 2 {
            return Err(Error::SdpParse(format!("bad m-line: {m_line}")));
        }
        let port_str = port.to_string();
        parts[1] = &port_str;
        self.lines[0] = parts.join(" ");
        self.port = port;
        Ok(())
    }
}

/// An SDP document split into session-level lines and media sections
#[derive(Debug, Clone)]
pub struct SdpDocument {
    /// Lines preceding the first m-line
    pub session_lines: Vec<String>,
    /// Media sections in order of appearance
    pub media: Vec<MediaSection>,
}

impl SdpDocument {
    /// Split an SDP body into session lines and media sections
    pub fn parse(sdp: &str) -> Result<Self> {
        let mut session_lines = Vec::new();
        let mut media: Vec<MediaSection> = Vec::new();

        for raw in sdp.lines() {
            let line = raw.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix("m=") {
                let mut parts = rest.split(' ');
                let kind = parts
                    .next()
                    .ok_or_else(|| Error::SdpParse(format!("bad m-line: {line}")))?
                    .to_string();
                let port = parts
                    .next()
                    .and_then(|p| p.parse().ok())
                    .ok_or_else(|| Error::SdpParse(format!("bad m-line port: {line}")))?;
                media.push(MediaSection {
                    kind,
                    port,
                    lines: vec![line.to_string()],
                });
            } else if let Some(section) = media.last_mut() {
                section.lines.push(line.to_string());
            } else {
                session_lines.push(line.to_string());
            }
        }
        Ok(Self {
            session_lines,
            media,
        })
    }

    /// Value of a session-level `a=<name>:` attribute
    pub fn attribute(&self, name: &str) -> Option<&str> {
        attribute_in(&self.session_lines, name)
    }

    /// Connection address from the first `c=` line found, session level
    /// first, then per-section
    pub fn connection_address(&self) -> Option<String> {
        let all = self
            .session_lines
            .iter()
            .chain(self.media.iter().flat_map(|m| m.lines.iter()));
        for line in all {
            if let Some(rest) = line.strip_prefix("c=") {
                // "IN IP4 203.0.113.9"
                if let Some(addr) = rest.split(' ').nth(2) {
                    return Some(addr.to_string());
                }
            }
        }
        None
    }

    /// Media section of the given kind, if present
    pub fn section(&self, kind: &str) -> Option<&MediaSection> {
        self.media.iter().find(|m| m.kind == kind)
    }

    /// Mutable media section of the given kind
    pub fn section_mut(&mut self, kind: &str) -> Option<&mut MediaSection> {
        self.media.iter_mut().find(|m| m.kind == kind)
    }

    /// Serialize back to CRLF-terminated SDP text
    pub fn to_sdp(&self) -> String {
        let mut out = String::new();
        for line in &self.session_lines {
            out.push_str(line);
            out.push_str("\r\n");
        }
        for section in &self.media {
            for line in &section.lines {
                out.push_str(line);
                out.push_str("\r\n");
            }
        }
        out
    }
}

fn attribute_in<'a>(lines: &'a [String], name: &str) -> Option<&'a str> {
    let flag = format!("a={name}");
    let prefix = format!("a={name}:");
    lines.iter().find_map(|line| {
        if let Some(value) = line.strip_prefix(&prefix) {
            Some(value)
        } else if line == &flag {
            Some("")
        } else {
            None
        }
    })
}

/// Remove the video section from an SDP body, leaving everything else
/// untouched. Used when a consumer asked for an audio-only pipeline.
pub fn remove_video_section(sdp: &str) -> Result<String> {
    let mut doc = SdpDocument::parse(sdp)?;
    doc.media.retain(|m| m.kind != "video");
    Ok(doc.to_sdp())
}

/// Rewrite the audio and video m-line ports, e.g. to point the remote SDP
/// at local transcoder inputs. A `None` leaves that leg's port alone.
pub fn rewrite_media_ports(
    sdp: &str,
    audio_port: Option<u16>,
    video_port: Option<u16>,
) -> Result<String> {
    let mut doc = SdpDocument::parse(sdp)?;
    if let (Some(port), Some(section)) = (audio_port, doc.section_mut("audio")) {
        section.set_port(port)?;
    }
    if let (Some(port), Some(section)) = (video_port, doc.section_mut("video")) {
        section.set_port(port)?;
    }
    Ok(doc.to_sdp())
}

/// True when the audio section negotiated Opus rather than PCMU.
///
/// Decides which audio arguments the transcoder is started with.
pub fn prefers_opus(sdp: &str) -> bool {
    match SdpDocument::parse(sdp) {
        Ok(doc) => doc
            .section("audio")
            .map(|audio| {
                audio
                    .lines
                    .iter()
                    .any(|line| line.starts_with("a=rtpmap:") && line.to_lowercase().contains("opus/48000"))
            })
            .unwrap_or(false),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANSWER: &str = "v=0\r\n\
        o=- 3697 3697 IN IP4 203.0.113.9\r\n\
        s=camera\r\n\
        c=IN IP4 203.0.113.9\r\n\
        t=0 0\r\n\
        m=audio 29586 RTP/SAVP 0\r\n\
        a=rtpmap:0 PCMU/8000\r\n\
        a=crypto:1 AES_CM_128_HMAC_SHA1_80 inline:AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGw==\r\n\
        a=ssrc:1234567\r\n\
        m=video 29588 RTP/SAVP 99\r\n\
        a=rtpmap:99 H264/90000\r\n\
        a=crypto:1 AES_CM_128_HMAC_SHA1_80 inline:HBcWFRQTEhEQDw4NDAsKCQgHBgUEAwIBAAECAw==\r\n\
        a=ssrc:7654321\r\n";

    #[test]
    fn parses_sections() {
        let doc = SdpDocument::parse(ANSWER).unwrap();
        assert_eq!(doc.media.len(), 2);
        assert_eq!(doc.section("audio").unwrap().port, 29586);
        assert_eq!(doc.section("video").unwrap().port, 29588);
        assert_eq!(doc.connection_address().as_deref(), Some("203.0.113.9"));
        assert_eq!(
            doc.section("video").unwrap().attribute("ssrc"),
            Some("7654321")
        );
    }

    #[test]
    fn removes_exactly_the_video_section() {
        let cleaned = remove_video_section(ANSWER).unwrap();
        let m_lines: Vec<&str> = cleaned
            .lines()
            .filter(|l| l.starts_with("m="))
            .collect();
        assert_eq!(m_lines.len(), 1);
        assert!(!cleaned.contains("m=video"));
        assert!(cleaned.contains("m=audio"));
        // Video attributes went with the section
        assert!(!cleaned.contains("H264"));
    }

    #[test]
    fn removing_video_is_stable_without_video() {
        let audio_only = remove_video_section(ANSWER).unwrap();
        assert_eq!(remove_video_section(&audio_only).unwrap(), audio_only);
    }

    #[test]
    fn rewrites_ports() {
        let rewritten = rewrite_media_ports(ANSWER, Some(40000), Some(40002)).unwrap();
        assert!(rewritten.contains("m=audio 40000 RTP/SAVP 0"));
        assert!(rewritten.contains("m=video 40002 RTP/SAVP 99"));
        // Nothing else changed
        assert!(rewritten.contains("a=ssrc:1234567"));
    }

    #[test]
    fn opus_detection() {
        assert!(!prefers_opus(ANSWER));
        let opus = ANSWER.replace("a=rtpmap:0 PCMU/8000", "a=rtpmap:96 opus/48000/2");
        assert!(prefers_opus(&opus));
    }

    #[test]
    fn tolerates_bare_newlines() {
        let unix = ANSWER.replace("\r\n", "\n");
        let doc = SdpDocument::parse(&unix).unwrap();
        assert_eq!(doc.media.len(), 2);
    }
}
