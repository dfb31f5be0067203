// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! External settlement providers: quotes, status polling, swaps and prices.

pub mod prices;
pub mod quote;
pub mod status;

pub use prices::{HttpPriceSource, PriceBook, PriceSource, StaticPrices};
pub use quote::{
    HttpQuoteProvider, PreparedSwap, ProviderError, Quote, QuoteRequest, QuoteSwapProvider,
    RawStatusResponse, SwapRequest,
};
pub use status::{normalize, NormalizedStatus, StatusAdapter, StatusSnapshot};
