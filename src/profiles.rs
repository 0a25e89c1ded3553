use std::fmt;

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};

use crate::utils::bitmask_ops;

/// Bluetooth profiles tracked per device.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, EnumIter, Display, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    #[strum(to_string = "hfp")]
    Hfp,
    #[strum(to_string = "a2dp")]
    A2dp,
    #[strum(to_string = "avrcp")]
    Avrcp,
    #[strum(to_string = "scofwd")]
    ScoFwd,
    #[strum(to_string = "peer_signalling")]
    PeerSignalling,
    #[strum(to_string = "shadow")]
    Shadow,
}

impl Profile {
    const fn bit(self) -> u8 {
        match self {
            Self::Hfp => 1 << 0,
            Self::A2dp => 1 << 1,
            Self::Avrcp => 1 << 2,
            Self::ScoFwd => 1 << 3,
            Self::PeerSignalling => 1 << 4,
            Self::Shadow => 1 << 5,
        }
    }
}

/// Set of [`Profile`] values.
///
/// Serialises as a list of profile names.
#[derive(Clone, Copy, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(into = "Vec<Profile>", from = "Vec<Profile>")]
pub struct ProfileMask(u8);

bitmask_ops!(ProfileMask, u8);

impl ProfileMask {
    pub const HFP: Self = Self::of(Profile::Hfp);
    pub const A2DP: Self = Self::of(Profile::A2dp);
    pub const AVRCP: Self = Self::of(Profile::Avrcp);
    pub const SCOFWD: Self = Self::of(Profile::ScoFwd);
    pub const PEER_SIGNALLING: Self = Self::of(Profile::PeerSignalling);
    pub const SHADOW: Self = Self::of(Profile::Shadow);

    /// Profiles a handset connection cares about.
    pub const HANDSET: Self = Self(Self::HFP.0 | Self::A2DP.0 | Self::AVRCP.0);

    /// Mask holding a single profile.
    #[must_use]
    pub const fn of(profile: Profile) -> Self {
        Self(profile.bit())
    }

    /// Returns `true` when `profile` is in the mask.
    #[must_use]
    pub const fn has(self, profile: Profile) -> bool {
        self.0 & profile.bit() != 0
    }

    /// Iterates over the contained profiles in declaration order.
    pub fn iter(self) -> impl Iterator<Item = Profile> {
        Profile::iter().filter(move |profile| self.has(*profile))
    }

    /// Converts the mask to a list following `order`, skipping profiles
    /// that are not in the mask and appending any the order does not name.
    #[must_use]
    pub fn ordered(self, order: &[Profile]) -> Vec<Profile> {
        let mut ordered: Vec<Profile> = order
            .iter()
            .copied()
            .filter(|profile| self.has(*profile))
            .collect();
        for profile in self.iter() {
            if !ordered.contains(&profile) {
                ordered.push(profile);
            }
        }
        ordered
    }

    /// Number of profiles in the mask.
    #[must_use]
    pub fn count(self) -> u32 {
        self.0.count_ones()
    }
}

impl FromIterator<Profile> for ProfileMask {
    fn from_iter<I: IntoIterator<Item = Profile>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::EMPTY, |mask, profile| mask | Self::of(profile))
    }
}

impl From<Vec<Profile>> for ProfileMask {
    fn from(profiles: Vec<Profile>) -> Self {
        profiles.into_iter().collect()
    }
}

impl From<ProfileMask> for Vec<Profile> {
    fn from(mask: ProfileMask) -> Self {
        mask.iter().collect()
    }
}

impl fmt::Display for ProfileMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names: Vec<String> = self.iter().map(|profile| profile.to_string()).collect();
        f.write_str(&names.join("|"))
    }
}

impl fmt::Debug for ProfileMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProfileMask({self})")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    const HANDSET_ORDER: [Profile; 3] = [Profile::Hfp, Profile::A2dp, Profile::Avrcp];

    #[rstest]
    #[case(ProfileMask::HANDSET, vec![Profile::Hfp, Profile::A2dp, Profile::Avrcp])]
    #[case(ProfileMask::AVRCP | ProfileMask::HFP, vec![Profile::Hfp, Profile::Avrcp])]
    #[case(ProfileMask::A2DP | ProfileMask::SCOFWD, vec![Profile::A2dp, Profile::ScoFwd])]
    #[case(ProfileMask::EMPTY, vec![])]
    fn ordered_follows_connect_order(#[case] mask: ProfileMask, #[case] expected: Vec<Profile>) {
        assert_eq!(expected, mask.ordered(&HANDSET_ORDER));
    }

    #[test]
    fn display_joins_profile_names() {
        assert_eq!("hfp|a2dp", (ProfileMask::A2DP | ProfileMask::HFP).to_string());
        assert_eq!("none", ProfileMask::EMPTY.to_string());
    }

    #[test]
    fn serialises_as_profile_list() {
        let json = serde_json::to_string(&(ProfileMask::A2DP | ProfileMask::AVRCP))
            .expect("profile mask should serialise");

        assert_eq!(r#"["a2dp","avrcp"]"#, json);
        let back: ProfileMask =
            serde_json::from_str(&json).expect("profile list should deserialise");
        assert_eq!(ProfileMask::A2DP | ProfileMask::AVRCP, back);
    }
}
