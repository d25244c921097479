//! SSE 帧格式：服务端编码与客户端解析约定
//!
//! 每个事件一帧：`data: <JSON>` 一行，空行分隔；静默阶段由传输层按固定间隔
//! 注入注释帧（`: keep-alive`）防止空闲断连，解析方把注释帧过滤掉。
//! 生产方只发严格 JSON；仍解析失败的帧按不透明文本事件上交，不丢弃。

use serde::Serialize;

/// SSE 注释帧内容（keep-alive）
pub const KEEP_ALIVE_TEXT: &str = "keep-alive";

/// 解析后的帧
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedFrame {
    /// 正常事件载荷
    Event(serde_json::Value),
    /// 注释 / keep-alive 帧，非内容
    KeepAlive,
    /// 载荷不是合法 JSON：原样上交，交给上层展示
    Opaque(String),
}

/// 编码一帧：`data: <json>\n\n`
pub fn encode_frame<T: Serialize>(event: &T) -> String {
    let json = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    format!("data: {}\n\n", json)
}

/// 解析一帧（已按空行切分）。返回 None 表示空帧。
pub fn parse_frame(frame: &str) -> Option<ParsedFrame> {
    let line = frame.trim();
    if line.is_empty() {
        return None;
    }
    // 注释帧（axum KeepAlive 也走这里）
    if line.starts_with(':') {
        return Some(ParsedFrame::KeepAlive);
    }
    let payload = line
        .strip_prefix("data:")
        .map(|p| p.trim_start())
        .unwrap_or(line);
    if payload == KEEP_ALIVE_TEXT {
        return Some(ParsedFrame::KeepAlive);
    }
    match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(value) => Some(ParsedFrame::Event(value)),
        Err(_) => Some(ParsedFrame::Opaque(payload.to_string())),
    }
}

/// 将完整的 SSE 字节流按空行切帧并解析，过滤 keep-alive
pub fn parse_stream(body: &str) -> Vec<ParsedFrame> {
    body.split("\n\n")
        .filter_map(parse_frame)
        .filter(|f| *f != ParsedFrame::KeepAlive)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let ev = serde_json::json!({"type": "text_delta", "phase": "research", "text": "hi"});
        let frame = encode_frame(&ev);
        assert!(frame.starts_with("data: "));
        assert!(frame.ends_with("\n\n"));
        match parse_frame(&frame).unwrap() {
            ParsedFrame::Event(v) => assert_eq!(v, ev),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_keep_alive_filtered() {
        let body = "data: {\"type\":\"phase_start\",\"phase\":\"research\"}\n\n: keep-alive\n\ndata: {\"type\":\"finish\",\"status\":\"completed\"}\n\n";
        let frames = parse_stream(body);
        assert_eq!(frames.len(), 2);
        assert!(frames
            .iter()
            .all(|f| matches!(f, ParsedFrame::Event(_))));
    }

    #[test]
    fn test_malformed_payload_surfaced_as_opaque() {
        let frames = parse_stream("data: {'type': 'oops'}\n\n");
        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], ParsedFrame::Opaque(s) if s.contains("oops")));
    }
}
