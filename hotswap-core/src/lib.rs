//! Hotswap Core
//!
//! Core types and abstractions for the hotswap deployment service.
//!
//! This crate contains:
//! - Domain types: Core pipeline entities (Event, ExecStep, StepRecord, RegistryKey, etc.)
//! - DTOs: Response and request bodies served by the status API

pub mod domain;
pub mod dto;
