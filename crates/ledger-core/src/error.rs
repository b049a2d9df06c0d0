use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("difficulty {difficulty} exceeds the {max} hex digits of a block hash")]
    DifficultyOutOfRange { difficulty: usize, max: usize },
}
