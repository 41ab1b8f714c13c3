#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![doc = include_str!("../README.md")]

pub mod addr;
pub mod circular;
pub mod event;
pub mod fragment;
pub mod interface;
pub mod parse;

pub use {
    addr::{Address, InterfaceId},
    circular::CircularIter,
    event::{Subject, Subscription},
    fragment::Fragment,
    interface::{Interface, Status},
};
