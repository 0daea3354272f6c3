//! SDP offer construction and answer parsing for the legacy path
//!
//! The legacy backend expects a very specific offer shape: PCMU audio and
//! H.264 video, each m-line carrying crypto, ICE credentials and a single
//! host candidate. The answer comes back in the same dialect and is
//! reduced to one [`RtpStreamDescriptor`] per leg.

use std::net::IpAddr;

use chime_media_core::sdp::SdpDocument;
use chime_media_core::{Error as MediaError, IceCredentials, RtpStreamDescriptor, SrtpMaterial};

use crate::error::Result;

/// Everything needed to build the local SDP offer
#[derive(Debug, Clone)]
pub struct OfferParams {
    /// Address placed in the c= line and host candidates
    pub local_ip: IpAddr,
    /// Local audio RTP port
    pub audio_port: u16,
    /// Local video RTP port
    pub video_port: u16,
    /// SRTP material offered for the audio leg
    pub audio_srtp: SrtpMaterial,
    /// SRTP material offered for the video leg
    pub video_srtp: SrtpMaterial,
    /// SSRC we will send audio with
    pub audio_ssrc: u32,
    /// SSRC we will send video with
    pub video_ssrc: u32,
    /// Local ICE credentials, shared across both legs
    pub ice: IceCredentials,
}

/// The parsed SDP answer: remote address plus one descriptor per leg
#[derive(Debug, Clone)]
pub struct RemoteStreams {
    /// Remote media address from the answer's c= line
    pub address: String,
    pub audio: RtpStreamDescriptor,
    pub video: RtpStreamDescriptor,
    /// The answer as received, for downstream SDP rewriting
    pub sdp: String,
}

/// Build the SDP offer the legacy backend expects
pub fn build_offer(params: &OfferParams) -> String {
    let session_id: u32 = rand::random();
    let ip_type = match params.local_ip {
        IpAddr::V4(_) => "IP4",
        IpAddr::V6(_) => "IP6",
    };
    let mut sdp = format!(
        "v=0\r\n\
         o=- {session_id} {session_id} IN {ip_type} {ip}\r\n\
         s=chime\r\n\
         c=IN {ip_type} {ip}\r\n\
         t=0 0\r\n",
        ip = params.local_ip,
    );

    // Audio leg: PCMU only
    sdp.push_str(&format!(
        "m=audio {port} RTP/SAVP 0\r\n\
         a=rtpmap:0 PCMU/8000\r\n\
         a=crypto:{crypto}\r\n\
         a=ice-ufrag:{ufrag}\r\n\
         a=ice-pwd:{pwd}\r\n\
         a=candidate:1 1 udp 2130706431 {ip} {port} typ host\r\n\
         a=ssrc:{ssrc}\r\n\
         a=sendrecv\r\n",
        port = params.audio_port,
        crypto = params.audio_srtp.crypto_line_value(1),
        ufrag = params.ice.ufrag,
        pwd = params.ice.pwd,
        ip = params.local_ip,
        ssrc = params.audio_ssrc,
    ));

    // Video leg: H.264, baseline profile, non-interleaved packetization
    sdp.push_str(&format!(
        "m=video {port} RTP/SAVP 99\r\n\
         a=rtpmap:99 H264/90000\r\n\
         a=fmtp:99 packetization-mode=1;profile-level-id=42801F\r\n\
         a=crypto:{crypto}\r\n\
         a=ice-ufrag:{ufrag}\r\n\
         a=ice-pwd:{pwd}\r\n\
         a=candidate:1 1 udp 2130706431 {ip} {port} typ host\r\n\
         a=ssrc:{ssrc}\r\n\
         a=recvonly\r\n",
        port = params.video_port,
        crypto = params.video_srtp.crypto_line_value(1),
        ufrag = params.ice.ufrag,
        pwd = params.ice.pwd,
        ip = params.local_ip,
        ssrc = params.video_ssrc,
    ));

    sdp
}

/// Parse the SDP answer into per-leg stream descriptors.
///
/// Missing crypto or ssrc lines are a protocol violation: without them the
/// media path cannot be decrypted or demultiplexed, so the call fails with
/// a descriptive error instead of limping along.
pub fn parse_answer(sdp: &str, offer: &OfferParams) -> Result<RemoteStreams> {
    let doc = SdpDocument::parse(sdp)?;
    let address = doc
        .connection_address()
        .ok_or_else(|| MediaError::SdpParse("answer has no c= line".into()))?;

    let audio = parse_leg(&doc, "audio", offer.audio_port)?;
    let video = parse_leg(&doc, "video", offer.video_port)?;
    Ok(RemoteStreams {
        address,
        audio,
        video,
        sdp: sdp.to_string(),
    })
}

fn parse_leg(doc: &SdpDocument, kind: &str, local_port: u16) -> Result<RtpStreamDescriptor> {
    let section = doc
        .section(kind)
        .ok_or_else(|| MediaError::SdpParse(format!("answer has no {kind} section")))?;

    let crypto = section
        .attribute("crypto")
        .ok_or_else(|| MediaError::SdpParse(format!("{kind} section has no crypto line")))?;
    // "1 AES_CM_128_HMAC_SHA1_80 inline:<base64>"
    let inline = crypto
        .split_whitespace()
        .find_map(|part| part.strip_prefix("inline:"))
        .ok_or_else(|| MediaError::SdpParse(format!("{kind} crypto line has no inline key")))?;
    // Trailing lifetime/MKI parameters, if any, follow a '|'
    let inline = inline.split('|').next().unwrap_or(inline);
    let srtp = SrtpMaterial::from_base64(inline)?;

    let ssrc_value = section
        .attribute("ssrc")
        .ok_or_else(|| MediaError::SdpParse(format!("{kind} section has no ssrc line")))?;
    let ssrc = ssrc_value
        .split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| MediaError::SdpParse(format!("bad ssrc value: {ssrc_value}")))?;

    let ice = match (section.attribute("ice-ufrag"), section.attribute("ice-pwd")) {
        (Some(ufrag), Some(pwd)) => Some(IceCredentials {
            ufrag: ufrag.to_string(),
            pwd: pwd.to_string(),
        }),
        _ => None,
    };

    Ok(RtpStreamDescriptor {
        local_port,
        remote_port: section.port,
        ssrc,
        ice,
        srtp: Some(srtp),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer_params() -> OfferParams {
        OfferParams {
            local_ip: "10.0.0.5".parse().unwrap(),
            audio_port: 51000,
            video_port: 51002,
            audio_srtp: SrtpMaterial {
                key: [1; 16],
                salt: [2; 14],
            },
            video_srtp: SrtpMaterial {
                key: [3; 16],
                salt: [4; 14],
            },
            audio_ssrc: 111,
            video_ssrc: 222,
            ice: IceCredentials {
                ufrag: "chimeuf".into(),
                pwd: "chimepwd01234567890123".into(),
            },
        }
    }

    fn answer() -> String {
        let key = SrtpMaterial {
            key: [9; 16],
            salt: [8; 14],
        };
        format!(
            "v=0\r\n\
             o=- 1 1 IN IP4 203.0.113.9\r\n\
             s=-\r\n\
             c=IN IP4 203.0.113.9\r\n\
             t=0 0\r\n\
             m=audio 29586 RTP/SAVP 0\r\n\
             a=crypto:{crypto}\r\n\
             a=ice-ufrag:remoteuf\r\n\
             a=ice-pwd:remotepwd\r\n\
             a=ssrc:1001\r\n\
             m=video 29588 RTP/SAVP 99\r\n\
             a=crypto:{crypto}\r\n\
             a=ssrc:2002 cname:cam\r\n",
            crypto = key.crypto_line_value(1),
        )
    }

    #[test]
    fn offer_has_both_legs_with_required_lines() {
        let sdp = build_offer(&offer_params());
        assert!(sdp.contains("m=audio 51000 RTP/SAVP 0"));
        assert!(sdp.contains("m=video 51002 RTP/SAVP 99"));
        assert_eq!(sdp.matches("a=crypto:").count(), 2);
        assert_eq!(sdp.matches("a=candidate:").count(), 2);
        assert_eq!(sdp.matches("a=ice-ufrag:chimeuf").count(), 2);
        assert!(sdp.contains("a=rtpmap:0 PCMU/8000"));
        assert!(sdp.contains("a=rtpmap:99 H264/90000"));
    }

    #[test]
    fn answer_parses_into_descriptors() {
        let streams = parse_answer(&answer(), &offer_params()).unwrap();
        assert_eq!(streams.address, "203.0.113.9");
        assert_eq!(streams.audio.remote_port, 29586);
        assert_eq!(streams.audio.local_port, 51000);
        assert_eq!(streams.audio.ssrc, 1001);
        assert_eq!(streams.video.remote_port, 29588);
        assert_eq!(streams.video.ssrc, 2002);
        assert!(streams.audio.srtp.is_some());
        assert_eq!(streams.audio.ice.as_ref().unwrap().ufrag, "remoteuf");
        assert!(streams.video.ice.is_none());
    }

    #[test]
    fn missing_crypto_is_an_error() {
        let broken: String = answer()
            .lines()
            .filter(|l| !l.starts_with("a=crypto"))
            .map(|l| format!("{l}\r\n"))
            .collect();
        let err = parse_answer(&broken, &offer_params()).unwrap_err();
        assert!(err.to_string().contains("crypto"));
    }

    #[test]
    fn missing_ssrc_is_an_error() {
        let broken: String = answer()
            .lines()
            .filter(|l| !l.starts_with("a=ssrc"))
            .map(|l| format!("{l}\r\n"))
            .collect();
        let err = parse_answer(&broken, &offer_params()).unwrap_err();
        assert!(err.to_string().contains("ssrc"));
    }
}
