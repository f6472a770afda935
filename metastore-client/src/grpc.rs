//! Service stubs for the etcd v3 gRPC API.
//!
//! Hand-written in the shape tonic generates, against the message types in
//! [`metastore_core::proto`]. Only the methods this client calls are kept.

use futures::Stream;
use metastore_core::proto::{election, rpc};
use tonic::codegen::http;
use tonic::transport::Channel;

macro_rules! ready {
    ($inner:expr) => {
        $inner
            .ready()
            .await
            .map_err(|e| tonic::Status::unknown(format!("service was not ready: {e}")))?
    };
}

/// Client for the `etcdserverpb.KV` service.
#[derive(Clone, Debug)]
pub struct KvClient {
    inner: tonic::client::Grpc<Channel>,
}

impl KvClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    pub async fn range(
        &mut self,
        request: tonic::Request<rpc::RangeRequest>,
    ) -> Result<tonic::Response<rpc::RangeResponse>, tonic::Status> {
        ready!(self.inner);
        let codec = tonic::codec::ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static("/etcdserverpb.KV/Range");
        self.inner.unary(request, path, codec).await
    }

    pub async fn put(
        &mut self,
        request: tonic::Request<rpc::PutRequest>,
    ) -> Result<tonic::Response<rpc::PutResponse>, tonic::Status> {
        ready!(self.inner);
        let codec = tonic::codec::ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static("/etcdserverpb.KV/Put");
        self.inner.unary(request, path, codec).await
    }

    pub async fn delete_range(
        &mut self,
        request: tonic::Request<rpc::DeleteRangeRequest>,
    ) -> Result<tonic::Response<rpc::DeleteRangeResponse>, tonic::Status> {
        ready!(self.inner);
        let codec = tonic::codec::ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static("/etcdserverpb.KV/DeleteRange");
        self.inner.unary(request, path, codec).await
    }

    pub async fn txn(
        &mut self,
        request: tonic::Request<rpc::TxnRequest>,
    ) -> Result<tonic::Response<rpc::TxnResponse>, tonic::Status> {
        ready!(self.inner);
        let codec = tonic::codec::ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static("/etcdserverpb.KV/Txn");
        self.inner.unary(request, path, codec).await
    }
}

/// Client for the `etcdserverpb.Watch` service.
#[derive(Clone, Debug)]
pub struct WatchClient {
    inner: tonic::client::Grpc<Channel>,
}

impl WatchClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    pub async fn watch<S>(
        &mut self,
        request: tonic::Request<S>,
    ) -> Result<tonic::Response<tonic::Streaming<rpc::WatchResponse>>, tonic::Status>
    where
        S: Stream<Item = rpc::WatchRequest> + Send + 'static,
    {
        ready!(self.inner);
        let codec = tonic::codec::ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static("/etcdserverpb.Watch/Watch");
        self.inner.streaming(request, path, codec).await
    }
}

/// Client for the `etcdserverpb.Lease` service.
#[derive(Clone, Debug)]
pub struct LeaseClient {
    inner: tonic::client::Grpc<Channel>,
}

impl LeaseClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    pub async fn lease_grant(
        &mut self,
        request: tonic::Request<rpc::LeaseGrantRequest>,
    ) -> Result<tonic::Response<rpc::LeaseGrantResponse>, tonic::Status> {
        ready!(self.inner);
        let codec = tonic::codec::ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static("/etcdserverpb.Lease/LeaseGrant");
        self.inner.unary(request, path, codec).await
    }

    pub async fn lease_revoke(
        &mut self,
        request: tonic::Request<rpc::LeaseRevokeRequest>,
    ) -> Result<tonic::Response<rpc::LeaseRevokeResponse>, tonic::Status> {
        ready!(self.inner);
        let codec = tonic::codec::ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static("/etcdserverpb.Lease/LeaseRevoke");
        self.inner.unary(request, path, codec).await
    }

    pub async fn lease_keep_alive<S>(
        &mut self,
        request: tonic::Request<S>,
    ) -> Result<tonic::Response<tonic::Streaming<rpc::LeaseKeepAliveResponse>>, tonic::Status>
    where
        S: Stream<Item = rpc::LeaseKeepAliveRequest> + Send + 'static,
    {
        ready!(self.inner);
        let codec = tonic::codec::ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static("/etcdserverpb.Lease/LeaseKeepAlive");
        self.inner.streaming(request, path, codec).await
    }
}

/// Client for the `etcdserverpb.Maintenance` service.
#[derive(Clone, Debug)]
pub struct MaintenanceClient {
    inner: tonic::client::Grpc<Channel>,
}

impl MaintenanceClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    pub async fn status(
        &mut self,
        request: tonic::Request<rpc::StatusRequest>,
    ) -> Result<tonic::Response<rpc::StatusResponse>, tonic::Status> {
        ready!(self.inner);
        let codec = tonic::codec::ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static("/etcdserverpb.Maintenance/Status");
        self.inner.unary(request, path, codec).await
    }
}

/// Client for the `v3electionpb.Election` service.
#[derive(Clone, Debug)]
pub struct ElectionClient {
    inner: tonic::client::Grpc<Channel>,
}

impl ElectionClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    pub async fn campaign(
        &mut self,
        request: tonic::Request<election::CampaignRequest>,
    ) -> Result<tonic::Response<election::CampaignResponse>, tonic::Status> {
        ready!(self.inner);
        let codec = tonic::codec::ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static("/v3electionpb.Election/Campaign");
        self.inner.unary(request, path, codec).await
    }

    pub async fn leader(
        &mut self,
        request: tonic::Request<election::LeaderRequest>,
    ) -> Result<tonic::Response<election::LeaderResponse>, tonic::Status> {
        ready!(self.inner);
        let codec = tonic::codec::ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static("/v3electionpb.Election/Leader");
        self.inner.unary(request, path, codec).await
    }

    pub async fn resign(
        &mut self,
        request: tonic::Request<election::ResignRequest>,
    ) -> Result<tonic::Response<election::ResignResponse>, tonic::Status> {
        ready!(self.inner);
        let codec = tonic::codec::ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static("/v3electionpb.Election/Resign");
        self.inner.unary(request, path, codec).await
    }

    pub async fn observe(
        &mut self,
        request: tonic::Request<election::LeaderRequest>,
    ) -> Result<tonic::Response<tonic::Streaming<election::LeaderResponse>>, tonic::Status> {
        ready!(self.inner);
        let codec = tonic::codec::ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static("/v3electionpb.Election/Observe");
        self.inner.server_streaming(request, path, codec).await
    }
}
