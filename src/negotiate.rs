//! Format negotiation.
//!
//! Shared mode is advisory: the system mixer may insist on its own format and suggest it. Exclusive
//! mode is authoritative: the device either takes the format or it does not. The negotiator walks
//! a short ladder of candidates and stops at the first one the device accepts outright.

use crate::traits::{AudioClient, FormatSupport};
use crate::{
    FormatRequest, NegotiateError, NegotiatedFormat, RejectReason, SampleFormat, ShareMode,
    WaveFormat, MAX_CHANNELS,
};

/// Encodings retried, in order, when the device has no opinion about the requested one.
const FALLBACK_FORMATS: [SampleFormat; 3] = [SampleFormat::F32, SampleFormat::I24, SampleFormat::I16];

/// Finds a wire format `client` accepts for `request` in `share_mode`.
pub(crate) fn negotiate(
    client: &dyn AudioClient,
    request: &FormatRequest,
    share_mode: ShareMode,
) -> Result<NegotiatedFormat, NegotiateError> {
    if request.channels == 0 {
        return Err(RejectReason::InvalidRequest("zero channels").into());
    }
    if request.channels > MAX_CHANNELS {
        return Err(RejectReason::InvalidRequest("too many channels").into());
    }
    if request.sample_rate.0 == 0 {
        return Err(RejectReason::InvalidRequest("zero sample rate").into());
    }

    let candidate = request.wave_format();
    match client.is_format_supported(share_mode, &candidate)? {
        FormatSupport::Exact => return Ok(accept(candidate, share_mode)),
        FormatSupport::Closest(suggested) if share_mode == ShareMode::Shared => {
            return validate_suggestion(&candidate, suggested).map(|f| accept(f, share_mode));
        }
        FormatSupport::Closest(_) | FormatSupport::Unsupported => {}
    }

    for sample_format in FALLBACK_FORMATS {
        let fallback = WaveFormat::new(
            request.channels,
            request.sample_rate,
            sample_format,
            request.channel_mask,
        );
        if fallback == candidate {
            continue;
        }
        if client.is_format_supported(share_mode, &fallback)? == FormatSupport::Exact {
            log::warn!("requested {candidate} is not supported, falling back to {fallback}");
            return Ok(accept(fallback, share_mode));
        }
    }

    let last_resort = WaveFormat::pcm16_stereo(request.sample_rate);
    if last_resort != candidate
        && client.is_format_supported(share_mode, &last_resort)? == FormatSupport::Exact
    {
        log::warn!("requested {candidate} is not supported, falling back to {last_resort}");
        return Ok(accept(last_resort, share_mode));
    }

    Err(RejectReason::NoAcceptableFormat.into())
}

fn validate_suggestion(
    candidate: &WaveFormat,
    suggested: WaveFormat,
) -> Result<WaveFormat, NegotiateError> {
    if suggested.sample_rate != candidate.sample_rate {
        return Err(RejectReason::SampleRateChanged {
            requested: candidate.sample_rate.0,
            suggested: suggested.sample_rate.0,
        }
        .into());
    }
    if suggested.channels != candidate.channels {
        return Err(RejectReason::ChannelCountChanged {
            requested: candidate.channels,
            suggested: suggested.channels,
        }
        .into());
    }
    log::debug!("device suggested {suggested} instead of {candidate}");
    Ok(suggested)
}

fn accept(format: WaveFormat, share_mode: ShareMode) -> NegotiatedFormat {
    log::debug!("negotiated {format} in {share_mode:?} mode");
    NegotiatedFormat::accepted(format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::Event;
    use crate::timing::ReferenceTime;
    use crate::traits::{CaptureClient, ClientInit, RenderClient};
    use crate::{ChannelMask, ClientError, FrameCount, SampleRate};
    use std::cell::RefCell;

    /// A client that only answers format queries.
    struct Oracle<F> {
        answer: F,
        asked: RefCell<Vec<WaveFormat>>,
    }

    impl<F> Oracle<F>
    where
        F: Fn(ShareMode, &WaveFormat) -> FormatSupport + Send,
    {
        fn new(answer: F) -> Self {
            Oracle {
                answer,
                asked: RefCell::new(Vec::new()),
            }
        }
    }

    impl<F> AudioClient for Oracle<F>
    where
        F: Fn(ShareMode, &WaveFormat) -> FormatSupport + Send,
    {
        fn is_format_supported(
            &self,
            share_mode: ShareMode,
            format: &WaveFormat,
        ) -> Result<FormatSupport, ClientError> {
            self.asked.borrow_mut().push(*format);
            Ok((self.answer)(share_mode, format))
        }

        fn mix_format(&self) -> Result<WaveFormat, ClientError> {
            Err(ClientError::NotInitialized)
        }

        fn initialize(&mut self, _: &ClientInit, _: &WaveFormat) -> Result<(), ClientError> {
            Err(ClientError::NotInitialized)
        }

        fn buffer_size(&self) -> Result<FrameCount, ClientError> {
            Err(ClientError::NotInitialized)
        }

        fn stream_latency(&self) -> Result<ReferenceTime, ClientError> {
            Err(ClientError::NotInitialized)
        }

        fn set_event_handle(&mut self, _: &Event) -> Result<(), ClientError> {
            Err(ClientError::NotInitialized)
        }

        fn start(&mut self) -> Result<(), ClientError> {
            Err(ClientError::NotInitialized)
        }

        fn stop(&mut self) -> Result<(), ClientError> {
            Err(ClientError::NotInitialized)
        }

        fn current_padding(&self) -> Result<FrameCount, ClientError> {
            Err(ClientError::NotInitialized)
        }

        fn capture_service(&mut self) -> Result<Box<dyn CaptureClient>, ClientError> {
            Err(ClientError::NotInitialized)
        }

        fn render_service(&mut self) -> Result<Box<dyn RenderClient>, ClientError> {
            Err(ClientError::NotInitialized)
        }
    }

    fn request(channels: u16, rate: u32, format: SampleFormat) -> FormatRequest {
        FormatRequest::new(channels, SampleRate(rate), format)
    }

    #[test]
    fn exact_match_is_accepted_unmodified() {
        let oracle = Oracle::new(|_, _| FormatSupport::Exact);
        let req = request(6, 48_000, SampleFormat::I24);
        let format = negotiate(&oracle, &req, ShareMode::Exclusive).unwrap();
        assert_eq!(*format.wave_format(), req.wave_format());
        assert_eq!(format.channel_mask, ChannelMask::SURROUND_5_1);
        assert_eq!(oracle.asked.borrow().len(), 1);
    }

    #[test]
    fn shared_suggestion_keeping_rate_and_channels_is_taken() {
        let mix = WaveFormat::new(2, SampleRate(48_000), SampleFormat::F32, None);
        let oracle = Oracle::new(move |_, _| FormatSupport::Closest(mix));
        let format = negotiate(&oracle, &request(2, 48_000, SampleFormat::I16), ShareMode::Shared)
            .unwrap();
        assert_eq!(*format.wave_format(), mix);
    }

    #[test]
    fn shared_suggestion_changing_rate_is_rejected() {
        let mix = WaveFormat::new(2, SampleRate(48_000), SampleFormat::F32, None);
        let oracle = Oracle::new(move |_, _| FormatSupport::Closest(mix));
        let err = negotiate(&oracle, &request(2, 44_100, SampleFormat::F32), ShareMode::Shared)
            .unwrap_err();
        assert_eq!(
            err,
            NegotiateError::Rejected(RejectReason::SampleRateChanged {
                requested: 44_100,
                suggested: 48_000
            })
        );
    }

    #[test]
    fn shared_suggestion_changing_channels_is_rejected() {
        let mix = WaveFormat::new(2, SampleRate(48_000), SampleFormat::F32, None);
        let oracle = Oracle::new(move |_, _| FormatSupport::Closest(mix));
        let err = negotiate(&oracle, &request(1, 48_000, SampleFormat::F32), ShareMode::Shared)
            .unwrap_err();
        assert!(matches!(
            err,
            NegotiateError::Rejected(RejectReason::ChannelCountChanged {
                requested: 1,
                suggested: 2
            })
        ));
    }

    #[test]
    fn fallback_menu_is_walked_in_order() {
        let oracle = Oracle::new(|_, f: &WaveFormat| {
            if f.sample_format() == Some(SampleFormat::I16) {
                FormatSupport::Exact
            } else {
                FormatSupport::Unsupported
            }
        });
        let format = negotiate(&oracle, &request(2, 96_000, SampleFormat::U8), ShareMode::Exclusive)
            .unwrap();
        assert_eq!(format.sample_format(), Some(SampleFormat::I16));
        assert_eq!(format.sample_rate, SampleRate(96_000));
        let asked: Vec<_> = oracle
            .asked
            .borrow()
            .iter()
            .map(|f| f.sample_format())
            .collect();
        assert_eq!(
            asked,
            [
                Some(SampleFormat::U8),
                Some(SampleFormat::F32),
                Some(SampleFormat::I24),
                Some(SampleFormat::I16)
            ]
        );
    }

    #[test]
    fn exclusive_suggestions_are_ignored() {
        let suggestion = WaveFormat::new(2, SampleRate(48_000), SampleFormat::F32, None);
        let oracle = Oracle::new(move |_, f: &WaveFormat| {
            if *f == WaveFormat::pcm16_stereo(SampleRate(48_000)) {
                FormatSupport::Exact
            } else {
                FormatSupport::Closest(suggestion)
            }
        });
        let format = negotiate(&oracle, &request(4, 48_000, SampleFormat::F32), ShareMode::Exclusive)
            .unwrap();
        assert_eq!(*format.wave_format(), WaveFormat::pcm16_stereo(SampleRate(48_000)));
    }

    #[test]
    fn nothing_accepted_is_a_rejection() {
        let oracle = Oracle::new(|_, _| FormatSupport::Unsupported);
        let err = negotiate(&oracle, &request(2, 48_000, SampleFormat::F32), ShareMode::Exclusive)
            .unwrap_err();
        assert_eq!(err, NegotiateError::Rejected(RejectReason::NoAcceptableFormat));
    }

    #[test]
    fn degenerate_requests_are_refused_without_asking() {
        let oracle = Oracle::new(|_, _| FormatSupport::Exact);
        assert!(negotiate(&oracle, &request(0, 48_000, SampleFormat::F32), ShareMode::Shared).is_err());
        assert!(negotiate(&oracle, &request(2, 0, SampleFormat::F32), ShareMode::Shared).is_err());
        let wide = request(MAX_CHANNELS + 1, 48_000, SampleFormat::F32);
        assert_eq!(
            negotiate(&oracle, &wide, ShareMode::Exclusive).unwrap_err(),
            NegotiateError::Rejected(RejectReason::InvalidRequest("too many channels"))
        );
        assert!(oracle.asked.borrow().is_empty());
    }

    #[test]
    fn accepted_format_renegotiates_unchanged() {
        let accepts = |_: ShareMode, f: &WaveFormat| {
            if f.channels == 2 && f.sample_format() == Some(SampleFormat::I24) {
                FormatSupport::Exact
            } else {
                FormatSupport::Unsupported
            }
        };
        let oracle = Oracle::new(accepts);
        for mode in [ShareMode::Shared, ShareMode::Exclusive] {
            let first = negotiate(&oracle, &request(2, 44_100, SampleFormat::I32), mode).unwrap();
            let again = FormatRequest::from_wave_format(first.wave_format()).unwrap();
            let second = negotiate(&oracle, &again, mode).unwrap();
            assert_eq!(first, second);
        }
    }
}
