//! Built-in handlers: protocol control, user control, AMF commands,
//! aggregates, and the NetConnection commands every client starts with.

use rtmp_core::amf::{self, AmfError, Cursor, Elt, Value};
use rtmp_core::message::{ControlMessage, LimitType, UserEvent};
use rtmp_core::wire::{read_u24, WireError, CSID_AMF_INI, MSID};
use rtmp_core::{Header, MessageType};

use crate::chunk::Message;
use crate::dispatch::{Dispatcher, Event, HandlerResult, Outcome};
use crate::session::{ConnectInfo, Session, SessionError};

/// Command names longer than this are cut short.
const COMMAND_NAME_CAPACITY: usize = 128;

/// Aggregate sub-message framing: 11-byte tag header, 4-byte trailer.
const AGGREGATE_HEADER: usize = 11;
const AGGREGATE_TRAILER: usize = 4;

/// Register everything a plain server needs.
pub fn register_defaults(d: &mut Dispatcher) {
    for t in [
        MessageType::SetChunkSize,
        MessageType::Abort,
        MessageType::Ack,
        MessageType::AckWindow,
        MessageType::PeerBandwidth,
    ] {
        d.register(t, protocol_message);
    }
    d.register(MessageType::UserControl, user_message);
    for t in [
        MessageType::AmfCommand,
        MessageType::AmfMeta,
        MessageType::AmfShared,
        MessageType::Amf3Command,
        MessageType::Amf3Meta,
        MessageType::Amf3Shared,
    ] {
        d.register(t, amf_message);
    }
    d.register(MessageType::Aggregate, aggregate_message);

    d.register_command("connect", connect);
    d.register_command("createStream", create_stream);
    d.register_command("closeStream", close_stream);
    d.register_command("deleteStream", delete_stream);
}

// ── Control ───────────────────────────────────────────────────────────────────

fn protocol_message(_: &Dispatcher, s: &mut Session, msg: &Message) -> HandlerResult {
    let h = &msg.header;
    let Some(t) = h.message_type() else {
        return Ok(Outcome::Continue);
    };
    match ControlMessage::parse(t, &msg.payload.to_vec())? {
        ControlMessage::SetChunkSize(size) => {
            tracing::debug!(id = s.id, size, "peer chunk size");
            s.demux.set_chunk_size(size, h.csid)?;
        }
        ControlMessage::Abort(csid) => {
            tracing::debug!(id = s.id, csid, "abort");
            s.demux.abort(csid);
        }
        ControlMessage::Ack(seq) => {
            tracing::trace!(id = s.id, seq, "ack");
        }
        ControlMessage::AckWindow(size) => {
            tracing::debug!(id = s.id, size, "ack window");
            s.ack_size = size;
        }
        ControlMessage::PeerBandwidth { size, limit } => {
            tracing::debug!(id = s.id, size, limit = ?LimitType::from_u8(limit), "peer bandwidth");
        }
    }
    Ok(Outcome::Continue)
}

fn user_message(_: &Dispatcher, s: &mut Session, msg: &Message) -> HandlerResult {
    match UserEvent::parse(&msg.payload.to_vec())? {
        UserEvent::PingRequest(ts) => {
            tracing::trace!(id = s.id, ts, "ping request, responding");
            s.send_user(UserEvent::PingResponse(ts))?;
        }
        UserEvent::PingResponse(ts) => {
            tracing::trace!(id = s.id, ts, "ping response");
        }
        UserEvent::SetBufferLength { msid, buflen_ms } => {
            tracing::debug!(id = s.id, msid, buflen_ms, "set buffer length");
            s.buflen_ms = buflen_ms;
        }
        other => {
            tracing::debug!(id = s.id, event = ?other, "user control event");
        }
    }
    Ok(Outcome::Continue)
}

// ── Commands ──────────────────────────────────────────────────────────────────

/// Decode the command name and hand the rest to the command table.
fn amf_message(d: &Dispatcher, s: &mut Session, msg: &Message) -> HandlerResult {
    let h = &msg.header;
    let Some(t) = h.message_type() else {
        return Ok(Outcome::Continue);
    };

    let mut cur = Cursor::from_chain(&msg.payload);
    if t.is_amf3() && !cur.is_empty() {
        // AMF3 messages carry a leading format byte before AMF0 content.
        cur.skip(1)?;
    }

    let mut name = String::new();
    let mut elt = Elt::string("", &mut name).capacity(COMMAND_NAME_CAPACITY);
    if t.is_shared_object() {
        elt = elt.typeless();
    }
    amf::decode(&mut cur, &mut [elt])?;

    tracing::debug!(id = s.id, command = %name, msg_type = t.name(), "AMF command");

    match d.dispatch_command(s, h, &name, &cur) {
        Some(result) => result,
        None => {
            tracing::debug!(id = s.id, command = %name, "unhandled command");
            match amf::skip_all(&mut cur) {
                Ok(_) => {}
                Err(AmfError::TooDeep) => return Err(AmfError::TooDeep.into()),
                Err(e) => {
                    tracing::debug!(id = s.id, command = %name, error = %e, "unhandled command body undecodable");
                }
            }
            Ok(Outcome::Continue)
        }
    }
}

fn connect(d: &Dispatcher, s: &mut Session, _: &Header, cur: &mut Cursor<'_>) -> HandlerResult {
    let mut trans = 0.0;
    let mut info = ConnectInfo::default();
    {
        let mut props = [
            Elt::string("app", &mut info.app),
            Elt::string("flashVer", &mut info.flash_ver),
            Elt::string("swfUrl", &mut info.swf_url),
            Elt::string("tcUrl", &mut info.tc_url),
            Elt::string("pageUrl", &mut info.page_url),
            Elt::number("audioCodecs", &mut info.audio_codecs),
            Elt::number("videoCodecs", &mut info.video_codecs),
            Elt::number("objectEncoding", &mut info.object_encoding),
        ];
        let mut elts = [Elt::number("", &mut trans), Elt::object("", &mut props)];
        amf::decode(cur, &mut elts)?;
    }

    if s.connect.is_some() {
        return Err(SessionError::DuplicateConnect);
    }

    let (app, args) = split_app(&info.app);
    info.app = app;
    info.args = args;
    tracing::info!(
        id = s.id,
        app = %info.app,
        args = %info.args,
        flash_ver = %info.flash_ver,
        swf_url = %info.swf_url,
        tc_url = %info.tc_url,
        page_url = %info.page_url,
        audio_codecs = info.audio_codecs,
        video_codecs = info.video_codecs,
        object_encoding = info.object_encoding,
        "connect"
    );

    let allowed = &s.config.server.applications;
    if !allowed.is_empty() && !allowed.iter().any(|a| *a == info.app) {
        return Err(SessionError::UnknownApplication(info.app));
    }

    let object_encoding = info.object_encoding;
    s.connect = Some(info);

    let ack_window = s.config.ack_window;
    let chunk_size = s.config.chunk.chunk_size;
    s.send_control(ControlMessage::AckWindow(ack_window))?;
    s.send_control(ControlMessage::PeerBandwidth {
        size: ack_window,
        limit: LimitType::Dynamic as u8,
    })?;
    s.send_control(ControlMessage::SetChunkSize(chunk_size))?;

    s.send_amf(
        CSID_AMF_INI,
        0,
        &[
            Value::string("_result"),
            Value::Number(trans),
            Value::object([
                ("fmsVer", Value::string("FMS/3,0,1,123")),
                ("capabilities", Value::Number(31.0)),
            ]),
            Value::object([
                ("level", Value::string("status")),
                ("code", Value::string("NetConnection.Connect.Success")),
                ("description", Value::string("Connection succeeded.")),
                ("objectEncoding", Value::Number(object_encoding)),
            ]),
        ],
    )?;

    d.fire(s, Event::Connect)?;
    Ok(Outcome::Continue)
}

/// Strip a trailing `/_definst_` or `/`, then split off `?args`.
fn split_app(raw: &str) -> (String, String) {
    let app = raw
        .strip_suffix("/_definst_")
        .or_else(|| raw.strip_suffix('/'))
        .unwrap_or(raw);
    match app.split_once('?') {
        Some((app, args)) => (app.to_string(), args.to_string()),
        None => (app.to_string(), String::new()),
    }
}

fn create_stream(_: &Dispatcher, s: &mut Session, _: &Header, cur: &mut Cursor<'_>) -> HandlerResult {
    let mut trans = 0.0;
    amf::decode(cur, &mut [Elt::number("", &mut trans)])?;
    tracing::debug!(id = s.id, trans, "createStream");

    s.send_amf(
        CSID_AMF_INI,
        0,
        &[
            Value::string("_result"),
            Value::Number(trans),
            Value::Null,
            Value::Number(MSID as f64),
        ],
    )?;
    Ok(Outcome::Handled)
}

/// `closeStream` and `deleteStream` share a layout: trans, null, stream.
fn decode_stream_command(cur: &mut Cursor<'_>) -> Result<f64, SessionError> {
    let mut trans = 0.0;
    let mut stream = 0.0;
    amf::decode(
        cur,
        &mut [
            Elt::number("", &mut trans),
            Elt::null(""),
            Elt::number("", &mut stream).optional(),
        ],
    )?;
    Ok(stream)
}

fn close_stream(_: &Dispatcher, s: &mut Session, h: &Header, cur: &mut Cursor<'_>) -> HandlerResult {
    let stream = decode_stream_command(cur)?;
    tracing::debug!(id = s.id, msid = h.msid, stream, "closeStream");
    Ok(Outcome::Continue)
}

fn delete_stream(_: &Dispatcher, s: &mut Session, _: &Header, cur: &mut Cursor<'_>) -> HandlerResult {
    let stream = decode_stream_command(cur)?;
    tracing::debug!(id = s.id, stream, "deleteStream");
    Ok(Outcome::Continue)
}

// ── Aggregate ─────────────────────────────────────────────────────────────────

/// Split an aggregate into its tagged sub-messages and dispatch each,
/// rebasing timestamps onto the aggregate's own.
fn aggregate_message(d: &Dispatcher, s: &mut Session, msg: &Message) -> HandlerResult {
    let h = &msg.header;
    let body = msg.payload.to_vec();
    let mut rest = &body[..];
    let mut first_ts = None;

    while !rest.is_empty() {
        if rest.len() < AGGREGATE_HEADER {
            return Err(WireError::Truncated {
                what: "aggregate header",
                need: AGGREGATE_HEADER,
                got: rest.len(),
            }
            .into());
        }
        let msg_type = rest[0];
        let len = read_u24([rest[1], rest[2], rest[3]]) as usize;
        let ts = read_u24([rest[4], rest[5], rest[6]]) | (rest[7] as u32) << 24;
        // rest[8..11] is the tag's stream id; the aggregate's own is used.

        let need = AGGREGATE_HEADER + len + AGGREGATE_TRAILER;
        if rest.len() < need {
            return Err(WireError::Truncated { what: "aggregate body", need, got: rest.len() }.into());
        }
        let data = &rest[AGGREGATE_HEADER..AGGREGATE_HEADER + len];
        rest = &rest[need..];

        let base = *first_ts.get_or_insert(ts);
        if msg_type == MessageType::Aggregate as u8 {
            tracing::debug!(id = s.id, "nested aggregate skipped");
            continue;
        }

        let sub = Message {
            header: Header {
                csid: h.csid,
                timestamp: h.timestamp.wrapping_add(ts.wrapping_sub(base)),
                mlen: len as u32,
                msg_type,
                msid: h.msid,
            },
            payload: s.demux.pool().chain_from(data)?,
        };
        d.dispatch(s, &sub)?;
        if s.is_closed() {
            break;
        }
    }
    Ok(Outcome::Continue)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
