// SPDX-License-Identifier: BSD-3-Clause-LBNL
use std::collections::HashSet;
use tracing::trace;
use zerocopy::FromBytes;

use crate::constants::ETH_HEADER_SIZE;
use crate::defrag::protocol::{DetectionInfo, EthernetHeader, FragmentType};
use crate::errors::{DetectError, Error, Result};
use crate::metrics;

/// Classifies raw Ethernet frames and extracts fragment metadata without copying.
#[derive(Debug, Clone)]
pub struct Detector {
    pick_types: HashSet<FragmentType>,
}

impl Detector {
    pub fn new<I: IntoIterator<Item = FragmentType>>(pick_types: I) -> Result<Self> {
        let pick_types: HashSet<FragmentType> = pick_types.into_iter().collect();
        if pick_types.is_empty() {
            return Err(Error::NoValidFragmentType);
        }
        Ok(Self { pick_types })
    }

    pub fn picks(&self, frag_type: FragmentType) -> bool {
        self.pick_types.contains(&frag_type)
    }

    pub fn pick_types(&self) -> impl Iterator<Item = FragmentType> + '_ {
        self.pick_types.iter().copied()
    }

    /// Fills `info` from `buf`. Frames that are not IP, not picked or not fragmented leave
    /// `info.frag_type` unset and return `Ok`.
    pub fn fast_detect<'a>(
        &self,
        buf: &'a [u8],
        info: &mut DetectionInfo<'a>,
    ) -> std::result::Result<(), DetectError> {
        let result = self.detect_inner(buf, info);
        match &result {
            Ok(()) if info.is_fragment() => metrics::FRAGMENTS_DETECTED.inc(),
            Ok(()) => {}
            Err(e) => {
                trace!("detect failed on {} byte frame: {}", buf.len(), e);
                metrics::DETECT_ERRORS.with_label_values(&[e.kind()]).inc();
            }
        }
        result
    }

    fn detect_inner<'a>(
        &self,
        buf: &'a [u8],
        info: &mut DetectionInfo<'a>,
    ) -> std::result::Result<(), DetectError> {
        if buf.len() <= ETH_HEADER_SIZE {
            return Err(DetectError::LinkHeaderTooShort {
                needed: ETH_HEADER_SIZE + 1,
                available: buf.len(),
            });
        }
        let (eth, rest) =
            EthernetHeader::ref_from_prefix(buf).map_err(|_| DetectError::LinkHeaderTooShort {
                needed: ETH_HEADER_SIZE,
                available: buf.len(),
            })?;
        info.ether_type = eth.ether_type.get();
        let Some(frag_type) = FragmentType::from_ether_type(info.ether_type) else {
            return Ok(());
        };
        info.link = Some(eth);
        info.eth_payload = rest;
        if !self.picks(frag_type) {
            return Ok(());
        }
        frag_type.handler().fast_detect(rest, info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defrag::testutil::{ipv4_fragment, ipv6_fragment, FlowSpec};

    #[test]
    fn empty_pick_list_is_rejected() {
        assert!(matches!(
            Detector::new(Vec::new()),
            Err(Error::NoValidFragmentType)
        ));
        let detector = Detector::new([FragmentType::Ipv4, FragmentType::Ipv4]).unwrap();
        assert_eq!(detector.pick_types().count(), 1);
    }

    #[test]
    fn short_link_header() {
        let detector = Detector::new(FragmentType::ALL).unwrap();
        for len in [0, 1, ETH_HEADER_SIZE] {
            let frame = vec![0u8; len];
            let mut info = DetectionInfo::default();
            assert!(matches!(
                detector.fast_detect(&frame, &mut info),
                Err(DetectError::LinkHeaderTooShort { .. })
            ));
        }
    }

    #[test]
    fn non_ip_is_ignored() {
        let detector = Detector::new(FragmentType::ALL).unwrap();
        let mut frame = vec![0u8; 60];
        frame[12..14].copy_from_slice(&0x0806u16.to_be_bytes());
        let mut info = DetectionInfo::default();
        detector.fast_detect(&frame, &mut info).unwrap();
        assert_eq!(info.ether_type, 0x0806);
        assert!(!info.is_fragment());
    }

    #[test]
    fn unpicked_type_is_ignored() {
        let detector = Detector::new([FragmentType::Ipv6]).unwrap();
        let frame = ipv4_fragment(&FlowSpec::v4(1), 0, true, &[0u8; 16]);
        let mut info = DetectionInfo::default();
        detector.fast_detect(&frame, &mut info).unwrap();
        assert!(!info.is_fragment());

        let frame = ipv6_fragment(&FlowSpec::v6(1), 0, true, &[0u8; 16]);
        let mut info = DetectionInfo::default();
        detector.fast_detect(&frame, &mut info).unwrap();
        assert!(info.is_fragment());
        assert!(info.group_id().is_some());
    }

    #[test]
    fn short_network_headers() {
        let detector = Detector::new(FragmentType::ALL).unwrap();

        let v4 = ipv4_fragment(&FlowSpec::v4(1), 0, true, &[0u8; 16]);
        let mut info = DetectionInfo::default();
        assert!(matches!(
            detector.fast_detect(&v4[..ETH_HEADER_SIZE + 20], &mut info),
            Err(DetectError::Ipv4HeaderTooShort { .. })
        ));

        let v6 = ipv6_fragment(&FlowSpec::v6(1), 0, true, &[0u8; 16]);
        let mut info = DetectionInfo::default();
        assert!(matches!(
            detector.fast_detect(&v6[..ETH_HEADER_SIZE + 30], &mut info),
            Err(DetectError::Ipv6HeaderTooShort { .. })
        ));
        let mut info = DetectionInfo::default();
        assert!(matches!(
            detector.fast_detect(&v6[..ETH_HEADER_SIZE + 48], &mut info),
            Err(DetectError::Ipv6HeaderTooShort { .. })
        ));
    }
}
