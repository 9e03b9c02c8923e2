/// Backend -> proxy.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerMessage {
    #[prost(oneof = "server_message::Msg", tags = "1, 2, 3, 4, 5, 6")]
    pub msg: ::core::option::Option<server_message::Msg>,
}
/// Nested message and enum types in `ServerMessage`.
pub mod server_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Msg {
        #[prost(message, tag = "1")]
        Register(super::RegisterServer),
        #[prost(message, tag = "2")]
        Heartbeat(super::Heartbeat),
        #[prost(message, tag = "3")]
        RouteResult(super::RouteResult),
        #[prost(message, tag = "4")]
        HealthProbeAck(super::HealthProbeAck),
        #[prost(message, tag = "5")]
        Deregister(super::Deregister),
        #[prost(message, tag = "6")]
        RouteDirective(super::RouteDirective),
    }
}
/// Proxy -> backend.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProxyMessage {
    #[prost(oneof = "proxy_message::Msg", tags = "1, 2, 3, 4, 5")]
    pub msg: ::core::option::Option<proxy_message::Msg>,
}
/// Nested message and enum types in `ProxyMessage`.
pub mod proxy_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Msg {
        #[prost(message, tag = "1")]
        RegisterAck(super::RegisterAck),
        #[prost(message, tag = "2")]
        RouteDirective(super::RouteDirective),
        #[prost(message, tag = "3")]
        HealthProbe(super::HealthProbe),
        #[prost(message, tag = "4")]
        RouteResult(super::RouteResult),
        #[prost(message, tag = "5")]
        Drain(super::DrainRequest),
    }
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterServer {
    #[prost(string, tag = "1")]
    pub server_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub address: ::prost::alloc::string::String,
    #[prost(uint32, tag = "3")]
    pub max_capacity: u32,
    #[prost(string, tag = "4")]
    pub version: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterAck {
    #[prost(bool, tag = "1")]
    pub accepted: bool,
    #[prost(string, tag = "2")]
    pub reason: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Heartbeat {
    #[prost(string, tag = "1")]
    pub server_id: ::prost::alloc::string::String,
    #[prost(uint32, tag = "2")]
    pub current_player_count: u32,
    #[prost(double, tag = "3")]
    pub load: f64,
    /// Lowercase status name: starting, live, draining, dead.
    #[prost(string, tag = "4")]
    pub status: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RouteDirective {
    #[prost(string, tag = "1")]
    pub request_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub player_id: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub target_server_id: ::prost::alloc::string::String,
    /// Empty when the proxy originates the directive.
    #[prost(string, tag = "4")]
    pub source_server_id: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RouteResult {
    #[prost(string, tag = "1")]
    pub request_id: ::prost::alloc::string::String,
    #[prost(bool, tag = "2")]
    pub accepted: bool,
    /// Stable reject code, empty when accepted.
    #[prost(string, tag = "3")]
    pub reject_reason: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HealthProbe {
    #[prost(uint64, tag = "1")]
    pub nonce: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HealthProbeAck {
    #[prost(uint64, tag = "1")]
    pub nonce: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Deregister {
    #[prost(string, tag = "1")]
    pub server_id: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DrainRequest {
    #[prost(string, tag = "1")]
    pub reason: ::prost::alloc::string::String,
}
#[doc = r" Generated client implementations."]
pub mod fleet_control_client {
    #![allow(unused_variables, dead_code, missing_docs)]
    use tonic::codegen::*;
    #[doc = " Control plane between a backend game server and the routing proxy. The backend opens one"]
    #[doc = " long-lived bidirectional stream per session."]
    pub struct FleetControlClient<T> {
        inner: tonic::client::Grpc<T>,
    }
    impl FleetControlClient<tonic::transport::Channel> {
        #[doc = r" Attempt to create a new client by connecting to a given endpoint."]
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: std::convert::TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }
    }
    impl<T> FleetControlClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::ResponseBody: Body + HttpBody + Send + 'static,
        T::Error: Into<StdError>,
        <T::ResponseBody as HttpBody>::Error: Into<StdError> + Send,
    {
        pub fn new(inner: T) -> Self {
            let inner = tonic::client::Grpc::new(inner);
            Self { inner }
        }
        pub fn with_interceptor(inner: T, interceptor: impl Into<tonic::Interceptor>) -> Self {
            let inner = tonic::client::Grpc::with_interceptor(inner, interceptor);
            Self { inner }
        }
        pub async fn control_session(
            &mut self,
            request: impl tonic::IntoStreamingRequest<Message = super::ServerMessage>,
        ) -> Result<tonic::Response<tonic::codec::Streaming<super::ProxyMessage>>, tonic::Status>
        {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/fleet.FleetControl/ControlSession");
            self.inner
                .streaming(request.into_streaming_request(), path, codec)
                .await
        }
    }
    impl<T: Clone> Clone for FleetControlClient<T> {
        fn clone(&self) -> Self {
            Self {
                inner: self.inner.clone(),
            }
        }
    }
    impl<T> std::fmt::Debug for FleetControlClient<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "FleetControlClient {{ ... }}")
        }
    }
}
#[doc = r" Generated server implementations."]
pub mod fleet_control_server {
    #![allow(unused_variables, dead_code, missing_docs)]
    use tonic::codegen::*;
    #[doc = "Generated trait containing gRPC methods that should be implemented for use with FleetControlServer."]
    #[async_trait]
    pub trait FleetControl: Send + Sync + 'static {
        #[doc = "Server streaming response type for the ControlSession method."]
        type ControlSessionStream: futures_core::Stream<Item = Result<super::ProxyMessage, tonic::Status>>
            + Send
            + Sync
            + 'static;
        async fn control_session(
            &self,
            request: tonic::Request<tonic::Streaming<super::ServerMessage>>,
        ) -> Result<tonic::Response<Self::ControlSessionStream>, tonic::Status>;
    }
    #[doc = " Control plane between a backend game server and the routing proxy. The backend opens one"]
    #[doc = " long-lived bidirectional stream per session."]
    #[derive(Debug)]
    pub struct FleetControlServer<T: FleetControl> {
        inner: _Inner<T>,
    }
    struct _Inner<T>(Arc<T>, Option<tonic::Interceptor>);
    impl<T: FleetControl> FleetControlServer<T> {
        pub fn new(inner: T) -> Self {
            let inner = Arc::new(inner);
            let inner = _Inner(inner, None);
            Self { inner }
        }
        pub fn with_interceptor(inner: T, interceptor: impl Into<tonic::Interceptor>) -> Self {
            let inner = Arc::new(inner);
            let inner = _Inner(inner, Some(interceptor.into()));
            Self { inner }
        }
    }
    impl<T, B> Service<http::Request<B>> for FleetControlServer<T>
    where
        T: FleetControl,
        B: HttpBody + Send + Sync + 'static,
        B::Error: Into<StdError> + Send + 'static,
    {
        type Response = http::Response<tonic::body::BoxBody>;
        type Error = Never;
        type Future = BoxFuture<Self::Response, Self::Error>;
        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
        fn call(&mut self, req: http::Request<B>) -> Self::Future {
            let inner = self.inner.clone();
            match req.uri().path() {
                "/fleet.FleetControl/ControlSession" => {
                    #[allow(non_camel_case_types)]
                    struct ControlSessionSvc<T: FleetControl>(pub Arc<T>);
                    impl<T: FleetControl> tonic::server::StreamingService<super::ServerMessage>
                        for ControlSessionSvc<T>
                    {
                        type Response = super::ProxyMessage;
                        type ResponseStream = T::ControlSessionStream;
                        type Future =
                            BoxFuture<tonic::Response<Self::ResponseStream>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<tonic::Streaming<super::ServerMessage>>,
                        ) -> Self::Future {
                            let inner = self.0.clone();
                            let fut = async move { (*inner).control_session(request).await };
                            Box::pin(fut)
                        }
                    }
                    let inner = self.inner.clone();
                    let fut = async move {
                        let interceptor = inner.1;
                        let inner = inner.0;
                        let method = ControlSessionSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = if let Some(interceptor) = interceptor {
                            tonic::server::Grpc::with_interceptor(codec, interceptor)
                        } else {
                            tonic::server::Grpc::new(codec)
                        };
                        let res = grpc.streaming(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                _ => Box::pin(async move {
                    Ok(http::Response::builder()
                        .status(200)
                        .header("grpc-status", "12")
                        .header("content-type", "application/grpc")
                        .body(tonic::body::BoxBody::empty())
                        .unwrap())
                }),
            }
        }
    }
    impl<T: FleetControl> Clone for FleetControlServer<T> {
        fn clone(&self) -> Self {
            let inner = self.inner.clone();
            Self { inner }
        }
    }
    impl<T: FleetControl> Clone for _Inner<T> {
        fn clone(&self) -> Self {
            Self(self.0.clone(), self.1.clone())
        }
    }
    impl<T: std::fmt::Debug> std::fmt::Debug for _Inner<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self.0)
        }
    }
    impl<T: FleetControl> tonic::transport::NamedService for FleetControlServer<T> {
        const NAME: &'static str = "fleet.FleetControl";
    }
}
