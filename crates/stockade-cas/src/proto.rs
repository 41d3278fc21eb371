//! Remote-execution wire messages for directory trees.
//!
//! Hand-declared prost messages matching the canonical field tags, so a
//! directory digest computed here agrees with one computed by any other
//! client of the protocol. Directory digests are SHA256 over the
//! message's canonical encoding.

/// A content digest as it appears on the wire.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Digest {
    #[prost(string, tag = "1")]
    pub hash: ::prost::alloc::string::String,
    #[prost(int64, tag = "2")]
    pub size_bytes: i64,
}

/// A single file within a directory.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileNode {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub digest: ::core::option::Option<Digest>,
    #[prost(bool, tag = "4")]
    pub is_executable: bool,
}

/// A named reference to a child directory.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DirectoryNode {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub digest: ::core::option::Option<Digest>,
}

/// A directory: ordered lists of files and subdirectories.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Directory {
    #[prost(message, repeated, tag = "1")]
    pub files: ::prost::alloc::vec::Vec<FileNode>,
    #[prost(message, repeated, tag = "2")]
    pub directories: ::prost::alloc::vec::Vec<DirectoryNode>,
}
