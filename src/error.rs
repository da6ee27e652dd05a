//! 에러 타입 정의
//!
//! 정책 거부(한도 초과, 중복 요청 등)는 에러가 아니라 사유 문자열 값으로
//! 다룬다. 여기에는 I/O와 구조적 실패만 올라온다.

use thiserror::Error;

/// PFS 엔진 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("팩 파일 접근 불가: {path}")]
    PackFileUnavailable { path: String },

    #[error("리슨 포트 할당 실패: 범위 {start}-{end}")]
    NoListenPort { start: u16, end: u16 },
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
