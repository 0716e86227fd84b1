use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint},
};

use crate::ClientError;

use super::Frame;

/// Server error reply. Its payload is an [`ErrorResponse`].
pub const ERROR_RESPONSE: u8 = 0;
pub const PING_REQUEST: u8 = 1;
pub const PING_RESPONSE: u8 = 2;
pub const COVERAGE_REQUEST: u8 = 100;
pub const COVERAGE_RESPONSE: u8 = 101;

/// Error code a node uses to reject a coverage context it no longer owns.
pub const STALE_COVERAGE_CODE: u32 = 404;

/// Payload encoding shared by every structured message.
pub(crate) fn wire_config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

pub fn encode_payload<E: Encode>(value: E) -> Result<Vec<u8>, ClientError> {
    Ok(bincode::encode_to_vec(value, wire_config())?)
}

pub fn decode_payload<D: Decode<()>>(bytes: &[u8]) -> Result<D, ClientError> {
    let (value, _) = bincode::decode_from_slice(bytes, wire_config())?;
    Ok(value)
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct ErrorResponse {
    pub code: u32,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn into_frame(self) -> Result<Frame, ClientError> {
        Ok(Frame::new(ERROR_RESPONSE, encode_payload(self)?))
    }
}

impl From<ErrorResponse> for ClientError {
    fn from(value: ErrorResponse) -> Self {
        ClientError::Application {
            code: value.code,
            message: value.message,
        }
    }
}

/// Interprets an error reply. Returns `None` for any other opcode.
///
/// An error frame whose payload cannot be decoded is still an application
/// error; the raw bytes become the message.
pub fn error_from_frame(frame: &Frame) -> Option<ClientError> {
    if frame.code != ERROR_RESPONSE {
        return None;
    }
    match decode_payload::<ErrorResponse>(&frame.payload) {
        Ok(resp) => Some(resp.into()),
        Err(_) => Some(ClientError::Application {
            code: 0,
            message: String::from_utf8_lossy(&frame.payload).into_owned(),
        }),
    }
}

pub fn ping() -> Frame {
    Frame::empty(PING_REQUEST)
}

/// Decoder for [`ping`] replies.
pub fn expect_pong(frame: Frame) -> Result<(), ClientError> {
    if frame.code == PING_RESPONSE {
        Ok(())
    } else {
        Err(ClientError::UnexpectedData(format!(
            "expected ping response, got opcode {}",
            frame.code
        )))
    }
}

/// Asks the cluster how a query over `table` is partitioned.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct CoverageRequest {
    pub table: String,
    pub query: String,
    /// Context of an entry being replaced, when re-planning one partition.
    pub replace_context: Option<Vec<u8>>,
}

impl CoverageRequest {
    pub fn into_frame(self) -> Result<Frame, ClientError> {
        Ok(Frame::new(COVERAGE_REQUEST, encode_payload(self)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_frame_becomes_application_error() {
        let frame = ErrorResponse::new(17, "no such bucket").into_frame().unwrap();
        let err = error_from_frame(&frame).unwrap();
        match err {
            ClientError::Application { code, message } => {
                assert_eq!(code, 17);
                assert_eq!(message, "no such bucket");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn undecodable_error_payload_keeps_text() {
        let frame = Frame::new(ERROR_RESPONSE, b"boom".to_vec());
        assert!(matches!(
            error_from_frame(&frame),
            Some(ClientError::Application { code: 0, ref message }) if message == "boom"
        ));
    }

    #[test]
    fn other_frames_are_not_errors() {
        assert!(error_from_frame(&Frame::empty(PING_RESPONSE)).is_none());
    }

    #[test]
    fn pong_decoder() {
        expect_pong(Frame::empty(PING_RESPONSE)).unwrap();
        assert!(matches!(
            expect_pong(Frame::empty(77)),
            Err(ClientError::UnexpectedData(_))
        ));
    }

    #[test]
    fn payloads_are_big_endian_fixint() {
        let bytes = encode_payload(ErrorResponse::new(1, "")).unwrap();
        assert_eq!(&bytes[..4], &[0, 0, 0, 1]);
    }

    #[test]
    fn coverage_request_payload() {
        let req = CoverageRequest {
            table: "GeoCheckin".into(),
            query: "select * from GeoCheckin".into(),
            replace_context: None,
        };
        let frame = req.clone().into_frame().unwrap();
        assert_eq!(frame.code, COVERAGE_REQUEST);
        assert_eq!(decode_payload::<CoverageRequest>(&frame.payload).unwrap(), req);
    }
}
