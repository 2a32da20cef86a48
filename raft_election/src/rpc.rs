//! Wire messages exchanged between election engines. Field names are part of
//! the wire contract (camelCase when serialized); the `to` field and the
//! request id are routing envelope, consumed by the transport.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::{ServerId, TermIndex};

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
/// Any message a transport can carry: a request or a reply.
pub enum RpcMessage {
    /// A request originated by a candidate or leader.
    Request(Request),
    /// A reply to an earlier request.
    Reply(ReplyTo),
}

impl RpcMessage {
    /// The peer this message originates from.
    pub fn from(&self) -> ServerId {
        match self {
            RpcMessage::Request(request) => request.from(),
            RpcMessage::Reply(reply) => reply.from(),
        }
    }

    /// The peer this message is addressed to.
    pub fn to(&self) -> ServerId {
        match self {
            RpcMessage::Request(request) => request.to(),
            RpcMessage::Reply(reply) => reply.to(),
        }
    }

    pub fn append_entries(append_entries: AppendEntries) -> Self {
        RpcMessage::Request(Request::AppendEntries(append_entries))
    }

    pub fn request_vote(request_vote: RequestVote) -> Self {
        RpcMessage::Request(Request::RequestVote(request_vote))
    }

    pub fn vote(vote: Vote) -> Self {
        RpcMessage::Reply(ReplyTo::RequestVote(vote))
    }

    pub fn ack_append_entries(ack: AppendEntriesAck) -> Self {
        RpcMessage::Reply(ReplyTo::AppendEntries(ack))
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// A candidate's request for this term's vote.
pub struct RequestVote {
    pub request_id: Uuid,
    pub candidate_id: ServerId,
    pub to: ServerId,
    pub term: TermIndex,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// A leader's keep-alive. Carries no log payload; its only job is to assert
/// the leader's authority for `term`.
pub struct AppendEntries {
    pub request_id: Uuid,
    pub leader_id: ServerId,
    pub to: ServerId,
    pub term: TermIndex,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
/// The two request kinds.
pub enum Request {
    AppendEntries(AppendEntries),
    RequestVote(RequestVote),
}

impl Request {
    pub fn from(&self) -> ServerId {
        match self {
            Request::AppendEntries(ae) => ae.leader_id,
            Request::RequestVote(rv) => rv.candidate_id,
        }
    }
    pub fn to(&self) -> ServerId {
        match self {
            Request::AppendEntries(ae) => ae.to,
            Request::RequestVote(rv) => rv.to,
        }
    }
    pub fn term(&self) -> TermIndex {
        match self {
            Request::AppendEntries(ae) => ae.term,
            Request::RequestVote(rv) => rv.term,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Reply to an [`AppendEntries`] heartbeat. `term` is the replier's current
/// term, which may be fresher than the sender's.
pub struct AppendEntriesAck {
    pub request_id: Uuid,
    pub from: ServerId,
    pub to: ServerId,
    pub term: TermIndex,
    pub success: bool,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Reply to a [`RequestVote`]. `term` is the replier's current term.
pub struct Vote {
    pub request_id: Uuid,
    pub from: ServerId,
    pub to: ServerId,
    pub term: TermIndex,
    pub granted: bool,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
/// The two reply kinds.
pub enum ReplyTo {
    AppendEntries(AppendEntriesAck),
    RequestVote(Vote),
}

impl ReplyTo {
    pub fn from(&self) -> ServerId {
        match self {
            ReplyTo::AppendEntries(ack) => ack.from,
            ReplyTo::RequestVote(vote) => vote.from,
        }
    }
    pub fn to(&self) -> ServerId {
        match self {
            ReplyTo::AppendEntries(ack) => ack.to,
            ReplyTo::RequestVote(vote) => vote.to,
        }
    }
    pub fn term(&self) -> TermIndex {
        match self {
            ReplyTo::AppendEntries(ack) => ack.term,
            ReplyTo::RequestVote(vote) => vote.term,
        }
    }
}
