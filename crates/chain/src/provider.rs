use std::sync::Arc;

use alloy::dyn_abi::{DynSolValue, FunctionExt, JsonAbiExt};
use alloy::json_abi::JsonAbi;
use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::{Filter, TransactionRequest};
use alloy::transports::{RpcError, TransportError, TransportErrorKind};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Mutex;

use crate::abi::{
    ContractAbis, FN_ALL_PAIRS, FN_PAIR_DETAILS, FN_PAIRS_BY_CREATOR, FN_PRESALE_CAP,
    FN_PRESALE_SOLD, FN_PRESALE_STATUS, FN_TOTAL_PAIRS,
};
use crate::decoder::{decode_log, selectors, to_json};
use crate::source::{
    ChainError, ChainSource, EventStream, PresaleState, RawEvent, RawRow, SliceResult,
};

/// Chain source backed by alloy providers: HTTP for reads, WebSocket for push.
pub struct AlloySource {
    http: DynProvider,
    ws_url: Option<String>,
    ws: Mutex<Option<DynProvider>>,
    factory_abi: JsonAbi,
    presale_abi: JsonAbi,
}

impl AlloySource {
    /// Create an HTTP-backed source. The WebSocket connection is dialed lazily on first subscribe.
    pub fn connect(rpc_url: &str, ws_url: Option<String>, abis: &ContractAbis) -> eyre::Result<Self> {
        let url = rpc_url.parse()?;
        let http = ProviderBuilder::new().connect_http(url).erased();
        Ok(Self {
            http,
            ws_url,
            ws: Mutex::new(None),
            factory_abi: abis.factory.clone(),
            presale_abi: abis.presale.clone(),
        })
    }

    async fn ws_provider(&self) -> Result<DynProvider, ChainError> {
        let Some(url) = self.ws_url.as_deref() else {
            return Err(ChainError::Unsupported("no WebSocket endpoint configured".into()));
        };

        let mut slot = self.ws.lock().await;
        if let Some(provider) = slot.as_ref() {
            return Ok(provider.clone());
        }

        let provider = ProviderBuilder::new()
            .connect_ws(WsConnect::new(url))
            .await
            .map_err(classify)?
            .erased();
        tracing::info!(url, "WebSocket provider connected");
        *slot = Some(provider.clone());
        Ok(provider)
    }

    /// Forget the cached WebSocket connection so the next subscribe re-dials.
    async fn drop_ws(&self) {
        self.ws.lock().await.take();
    }

    async fn call_view(
        &self,
        abi: &JsonAbi,
        to: Address,
        name: &str,
        args: &[DynSolValue],
    ) -> Result<Vec<DynSolValue>, ChainError> {
        let function = abi
            .function(name)
            .and_then(|overloads| overloads.first())
            .ok_or_else(|| ChainError::Abi(format!("function `{name}` is not declared")))?;

        let input = function
            .abi_encode_input(args)
            .map_err(|e| ChainError::Abi(e.to_string()))?;
        let tx = TransactionRequest::default().with_to(to).with_input(input);

        let output = self.http.call(tx).await.map_err(classify)?;
        if output.is_empty() {
            return Err(ChainError::Reverted(format!("{name} returned no data")));
        }
        function
            .abi_decode_output(&output)
            .map_err(|e| ChainError::Decode(e.to_string()))
    }

    async fn call_slice(
        &self,
        factory: Address,
        name: &str,
        args: &[DynSolValue],
    ) -> Result<SliceResult, ChainError> {
        let mut outputs = self
            .call_view(&self.factory_abi, factory, name, args)
            .await?
            .into_iter();

        let rows = match outputs.next() {
            Some(DynSolValue::Array(items)) => items.iter().filter_map(tuple_row).collect(),
            other => {
                return Err(ChainError::Decode(format!(
                    "{name}: expected an array of pairs, got {other:?}"
                )));
            }
        };
        let total = match outputs.next() {
            Some(DynSolValue::Uint(total, _)) => Some(saturating_u64(total)),
            _ => None,
        };
        Ok(SliceResult { rows, total })
    }

    /// A no-argument presale view returning a single unsigned integer.
    async fn presale_uint(&self, presale: Address, name: &str) -> Result<U256, ChainError> {
        match self.call_view(&self.presale_abi, presale, name, &[]).await?.first() {
            Some(DynSolValue::Uint(value, _)) => Ok(*value),
            other => Err(ChainError::Decode(format!("{name}: expected uint, got {other:?}"))),
        }
    }
}

fn tuple_row(value: &DynSolValue) -> Option<RawRow> {
    match value {
        DynSolValue::Tuple(fields) => Some(RawRow::Tuple(fields.iter().map(to_json).collect())),
        _ => None,
    }
}

fn saturating_u64(value: U256) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

fn classify(err: TransportError) -> ChainError {
    match &err {
        RpcError::ErrorResp(payload) => {
            // Code 3 is the standard "execution reverted" with revert data.
            if payload.code == 3 {
                ChainError::Reverted(payload.message.to_string())
            } else {
                ChainError::from_message(payload.message.to_string())
            }
        }
        RpcError::Transport(kind) => {
            if matches!(kind, TransportErrorKind::BackendGone) {
                ChainError::Disconnected(err.to_string())
            } else {
                ChainError::Transport(err.to_string())
            }
        }
        RpcError::UnsupportedFeature(feature) => ChainError::Unsupported(feature.to_string()),
        _ => ChainError::from_message(err.to_string()),
    }
}

#[async_trait]
impl ChainSource for AlloySource {
    async fn block_number(&self) -> Result<u64, ChainError> {
        self.http.get_block_number().await.map_err(classify)
    }

    async fn fetch_logs(
        &self,
        address: Address,
        abi: &JsonAbi,
        events: &[String],
        from: u64,
        to: u64,
    ) -> Result<Vec<RawEvent>, ChainError> {
        let filter = Filter::new()
            .address(address)
            .event_signature(selectors(abi, events)?)
            .from_block(from)
            .to_block(to);

        let logs = self.http.get_logs(&filter).await.map_err(classify)?;
        Ok(logs
            .iter()
            .filter(|log| !log.removed)
            .map(|log| decode_log(log, abi))
            .collect())
    }

    async fn subscribe_logs(
        &self,
        address: Address,
        abi: &JsonAbi,
        events: &[String],
    ) -> Result<EventStream, ChainError> {
        let filter = Filter::new()
            .address(address)
            .event_signature(selectors(abi, events)?);

        let provider = self.ws_provider().await?;
        let subscription = match provider.subscribe_logs(&filter).await {
            Ok(subscription) => subscription,
            Err(e) => {
                let err = classify(e);
                if err.is_transient() {
                    self.drop_ws().await;
                }
                return Err(err);
            }
        };

        let abi = Arc::new(abi.clone());
        let stream = subscription
            .into_stream()
            .filter(|log| futures::future::ready(!log.removed))
            .map(move |log| Ok(decode_log(&log, &abi)));
        Ok(stream.boxed())
    }

    async fn total_count(&self, factory: Address) -> Result<u64, ChainError> {
        match self
            .call_view(&self.factory_abi, factory, FN_TOTAL_PAIRS, &[])
            .await?
            .first()
        {
            Some(DynSolValue::Uint(total, _)) => Ok(saturating_u64(*total)),
            other => Err(ChainError::Decode(format!(
                "{FN_TOTAL_PAIRS}: expected uint256, got {other:?}"
            ))),
        }
    }

    async fn get_slice(
        &self,
        factory: Address,
        offset: u64,
        limit: u64,
    ) -> Result<SliceResult, ChainError> {
        let args = [
            DynSolValue::Uint(U256::from(offset), 256),
            DynSolValue::Uint(U256::from(limit), 256),
        ];
        self.call_slice(factory, FN_ALL_PAIRS, &args).await
    }

    async fn get_by_creator(
        &self,
        factory: Address,
        creator: Address,
        offset: u64,
        limit: u64,
    ) -> Result<SliceResult, ChainError> {
        let args = [
            DynSolValue::Address(creator),
            DynSolValue::Uint(U256::from(offset), 256),
            DynSolValue::Uint(U256::from(limit), 256),
        ];
        self.call_slice(factory, FN_PAIRS_BY_CREATOR, &args).await
    }

    async fn pair_details(&self, factory: Address, token: Address) -> Result<RawRow, ChainError> {
        let outputs = self
            .call_view(&self.factory_abi, factory, FN_PAIR_DETAILS, &[DynSolValue::Address(token)])
            .await?;
        outputs
            .first()
            .and_then(tuple_row)
            .ok_or_else(|| ChainError::Decode(format!("{FN_PAIR_DETAILS}: expected a tuple")))
    }

    async fn presale_state(&self, presale: Address) -> Result<PresaleState, ChainError> {
        let (status, capacity, sold) = futures::try_join!(
            self.presale_uint(presale, FN_PRESALE_STATUS),
            self.presale_uint(presale, FN_PRESALE_CAP),
            self.presale_uint(presale, FN_PRESALE_SOLD),
        )?;
        Ok(PresaleState {
            open_state: u8::try_from(saturating_u64(status)).unwrap_or(u8::MAX),
            sold,
            capacity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::rpc::json_rpc::ErrorPayload;

    #[test]
    fn revert_responses_are_reverts() {
        let payload = ErrorPayload {
            code: 3,
            message: "execution reverted".into(),
            data: None,
        };
        assert!(classify(RpcError::ErrorResp(payload)).is_revert());
    }

    #[test]
    fn dropped_backend_is_a_disconnect() {
        let err = classify(TransportErrorKind::backend_gone());
        assert!(matches!(err, ChainError::Disconnected(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn tuple_rows_are_positional() {
        let row = tuple_row(&DynSolValue::Tuple(vec![
            DynSolValue::String("Pad".into()),
            DynSolValue::Uint(U256::from(9u8), 256),
        ]));
        assert_eq!(
            row,
            Some(RawRow::Tuple(vec![serde_json::json!("Pad"), serde_json::json!("9")]))
        );
        assert_eq!(tuple_row(&DynSolValue::Bool(true)), None);
    }

    #[tokio::test]
    async fn source_without_ws_endpoint_reports_unsupported() {
        let abis = ContractAbis::builtin().unwrap();
        let source = AlloySource::connect("http://localhost:8545", None, &abis).unwrap();
        let err = source.ws_provider().await.unwrap_err();
        assert!(matches!(err, ChainError::Unsupported(_)));
    }
}
