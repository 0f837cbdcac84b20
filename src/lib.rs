//! Scans domains that impersonate a reference storefront and records evidence
//! about them: page analyses, similarity findings, and screenshots.

pub mod app;
