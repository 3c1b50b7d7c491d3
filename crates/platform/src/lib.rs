//! Operating-system integration (opening a completed file in its associated
//! application, shell/tray presence) is an explicit collaborator boundary,
//! not part of the core engine/storage/api crates. This crate intentionally
//! carries no implementation.
