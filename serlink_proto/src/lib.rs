#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![doc = include_str!("../README.md")]

pub mod handler;
pub mod header;
pub mod transfer;

pub use {
    handler::{FragmentationHandler, HandlerConfig, TransmitError},
    header::{FragmentHeader, FragmentKind},
    transfer::{AssignError, Transfer, TransferId, TransferMetadata},
};
