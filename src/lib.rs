//! Causerie is a terminal chat client that streams replies from a remote
//! Gemini model.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns the streaming pipeline: the observable transcript store,
//!   the generation client that turns one request into a stream of text
//!   fragments, and the turn controller that ties them together. It also
//!   holds configuration and credential resolution.
//! - [`api`] defines the request and response payloads of the generation
//!   endpoint.
//! - [`cli`] parses arguments and drives the line-oriented chat loop and the
//!   one-shot `say` command.
//! - [`utils`] holds the transcript log file and endpoint URL helpers.
//!
//! Embedders typically build a [`core::turn::TurnController`] from a
//! [`core::transcript::Transcript`] and any [`core::chat_stream::GenerationClient`],
//! subscribe to the transcript, and call
//! [`submit_turn`](core::turn::TurnController::submit_turn).

pub mod api;
pub mod cli;
pub mod core;
pub mod utils;
