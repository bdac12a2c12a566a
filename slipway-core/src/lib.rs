//! Slipway Core
//!
//! Core types shared by the Slipway build-and-run engine and its HTTP service.
//!
//! This crate contains:
//! - Domain types: build requests, deployment records, run status, log chunks
//! - DTOs: request/response bodies exchanged over the HTTP API

pub mod domain;
pub mod dto;
