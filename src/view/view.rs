//! Immutable membership views and their on-disk format.
//!
//! A view file is a whole-file rewrite of the fixed binary layout:
//! `vid:i32 | num_members:i32 | members:i32[N] | member_ips:(len:i32,
//! bytes)[N] | failed:u8[N] | num_failed:i32 | num_joined:i32 |
//! joined:i32[J] | num_departed:i32 | departed:i32[D] | my_rank:i32`,
//! all little-endian. The textual form consumed by the CLI tools is
//! line-oriented and produced by `to_text` / parsed by `parse_text`.

use std::net::SocketAddr;
use std::path::Path;

use crate::multicast::NodeId;
use crate::utils::ShardcastError;

/// Contact coordinates of one member, carried in a view's `member_ips`
/// entry as `ip:gms_port:sst_port:bulk_port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub ip: String,
    pub gms_port: u16,
    pub sst_port: u16,
    pub bulk_port: u16,
}

impl Contact {
    pub fn parse(contact: &str) -> Result<Self, ShardcastError> {
        let parts: Vec<&str> = contact.split(':').collect();
        if parts.len() != 4 {
            return Err(ShardcastError(format!(
                "malformed contact string '{}'",
                contact
            )));
        }
        Ok(Contact {
            ip: parts[0].to_string(),
            gms_port: parts[1].parse()?,
            sst_port: parts[2].parse()?,
            bulk_port: parts[3].parse()?,
        })
    }

    pub fn to_string(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.ip, self.gms_port, self.sst_port, self.bulk_port
        )
    }

    pub fn gms_addr(&self) -> Result<SocketAddr, ShardcastError> {
        Ok(format!("{}:{}", self.ip, self.gms_port).parse()?)
    }

    pub fn sst_addr(&self) -> Result<SocketAddr, ShardcastError> {
        Ok(format!("{}:{}", self.ip, self.sst_port).parse()?)
    }

    pub fn bulk_addr(&self) -> Result<SocketAddr, ShardcastError> {
        Ok(format!("{}:{}", self.ip, self.bulk_port).parse()?)
    }
}

/// Immutable snapshot of group membership. `members` and `failed` are
/// parallel; `vid` strictly increases across the life of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
    pub vid: i32,
    pub members: Vec<NodeId>,
    pub member_ips: Vec<String>,
    pub failed: Vec<bool>,
    pub num_failed: usize,
    pub joined: Vec<NodeId>,
    pub departed: Vec<NodeId>,
    pub my_rank: i32,
}

impl View {
    /// A fresh, fully-live view.
    pub fn new(
        vid: i32,
        members: Vec<NodeId>,
        member_ips: Vec<String>,
        my_rank: i32,
    ) -> Self {
        let num_members = members.len();
        debug_assert_eq!(num_members, member_ips.len());
        View {
            vid,
            members,
            member_ips,
            failed: vec![false; num_members],
            num_failed: 0,
            joined: Vec::new(),
            departed: Vec::new(),
            my_rank,
        }
    }

    #[inline]
    pub fn num_members(&self) -> usize {
        self.members.len()
    }

    /// Rank of the given node, if a member.
    pub fn rank_of(&self, node: NodeId) -> Option<usize> {
        self.members.iter().position(|&m| m == node)
    }

    /// The current leader: the lowest-ranked member not marked failed.
    pub fn leader_rank(&self) -> Option<usize> {
        self.failed.iter().position(|&failed| !failed)
    }

    pub fn i_am_leader(&self) -> bool {
        self.leader_rank() == Some(self.my_rank as usize)
    }

    /// Parsed contact of the member at the given rank.
    pub fn contact(&self, rank: usize) -> Result<Contact, ShardcastError> {
        Contact::parse(&self.member_ips[rank])
    }

    /// Serializes to the fixed binary layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&self.vid.to_le_bytes());
        bytes.extend_from_slice(
            &(self.members.len() as i32).to_le_bytes(),
        );
        for &member in &self.members {
            bytes.extend_from_slice(&(member as i32).to_le_bytes());
        }
        for ip in &self.member_ips {
            bytes.extend_from_slice(&(ip.len() as i32).to_le_bytes());
            bytes.extend_from_slice(ip.as_bytes());
        }
        for &failed in &self.failed {
            bytes.push(failed as u8);
        }
        bytes.extend_from_slice(&(self.num_failed as i32).to_le_bytes());
        bytes.extend_from_slice(&(self.joined.len() as i32).to_le_bytes());
        for &node in &self.joined {
            bytes.extend_from_slice(&(node as i32).to_le_bytes());
        }
        bytes
            .extend_from_slice(&(self.departed.len() as i32).to_le_bytes());
        for &node in &self.departed {
            bytes.extend_from_slice(&(node as i32).to_le_bytes());
        }
        bytes.extend_from_slice(&self.my_rank.to_le_bytes());
        bytes
    }

    /// Deserializes from the fixed binary layout.
    pub fn decode(bytes: &[u8]) -> Result<Self, ShardcastError> {
        let mut cursor = Cursor::new(bytes);
        let vid = cursor.read_i32()?;
        let num_members = cursor.read_i32()?;
        if num_members < 0 {
            return Err(ShardcastError(format!(
                "invalid num_members {}",
                num_members
            )));
        }
        let num_members = num_members as usize;

        let mut members = Vec::with_capacity(num_members);
        for _ in 0..num_members {
            members.push(cursor.read_i32()? as NodeId);
        }
        let mut member_ips = Vec::with_capacity(num_members);
        for _ in 0..num_members {
            let len = cursor.read_i32()?;
            if len < 0 {
                return Err(ShardcastError(format!(
                    "invalid string length {}",
                    len
                )));
            }
            member_ips
                .push(String::from_utf8(cursor.read_bytes(len as usize)?)?);
        }
        let mut failed = Vec::with_capacity(num_members);
        for _ in 0..num_members {
            failed.push(cursor.read_bytes(1)?[0] != 0);
        }
        let num_failed = cursor.read_i32()? as usize;
        let num_joined = cursor.read_i32()?;
        let mut joined = Vec::new();
        for _ in 0..num_joined {
            joined.push(cursor.read_i32()? as NodeId);
        }
        let num_departed = cursor.read_i32()?;
        let mut departed = Vec::new();
        for _ in 0..num_departed {
            departed.push(cursor.read_i32()? as NodeId);
        }
        let my_rank = cursor.read_i32()?;

        Ok(View {
            vid,
            members,
            member_ips,
            failed,
            num_failed,
            joined,
            departed,
            my_rank,
        })
    }

    /// Renders the line-oriented textual form.
    pub fn to_text(&self) -> String {
        let mut text = String::new();
        text.push_str(&format!("vid {}\n", self.vid));
        text.push_str(&format!("num_members {}\n", self.num_members()));
        for rank in 0..self.num_members() {
            text.push_str(&format!(
                "member {} {} {}\n",
                self.members[rank],
                self.member_ips[rank],
                self.failed[rank] as u8
            ));
        }
        text.push_str("joined");
        for &node in &self.joined {
            text.push_str(&format!(" {}", node));
        }
        text.push('\n');
        text.push_str("departed");
        for &node in &self.departed {
            text.push_str(&format!(" {}", node));
        }
        text.push('\n');
        text.push_str(&format!("my_rank {}\n", self.my_rank));
        text
    }

    /// Parses the line-oriented textual form.
    pub fn parse_text(text: &str) -> Result<Self, ShardcastError> {
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());

        let vid = parse_keyed_line(lines.next(), "vid")?.parse()?;
        let num_members: usize =
            parse_keyed_line(lines.next(), "num_members")?.parse()?;

        let mut members = Vec::with_capacity(num_members);
        let mut member_ips = Vec::with_capacity(num_members);
        let mut failed = Vec::with_capacity(num_members);
        for _ in 0..num_members {
            let rest = parse_keyed_line(lines.next(), "member")?;
            let fields: Vec<&str> = rest.split_whitespace().collect();
            if fields.len() != 3 {
                return Err(ShardcastError(format!(
                    "malformed member line '{}'",
                    rest
                )));
            }
            members.push(fields[0].parse::<NodeId>()?);
            member_ips.push(fields[1].to_string());
            failed.push(fields[2].parse::<u8>()? != 0);
        }

        let joined = parse_keyed_line(lines.next(), "joined")?
            .split_whitespace()
            .map(|f| f.parse::<NodeId>())
            .collect::<Result<Vec<_>, _>>()?;
        let departed = parse_keyed_line(lines.next(), "departed")?
            .split_whitespace()
            .map(|f| f.parse::<NodeId>())
            .collect::<Result<Vec<_>, _>>()?;
        let my_rank = parse_keyed_line(lines.next(), "my_rank")?.parse()?;

        let num_failed = failed.iter().filter(|&&f| f).count();
        Ok(View {
            vid,
            members,
            member_ips,
            failed,
            num_failed,
            joined,
            departed,
            my_rank,
        })
    }
}

/// Extracts the value part of a `key value...` line.
fn parse_keyed_line<'l>(
    line: Option<&'l str>,
    key: &str,
) -> Result<&'l str, ShardcastError> {
    let Some(line) = line else {
        return Err(ShardcastError(format!(
            "missing '{}' line in view text",
            key
        )));
    };
    match line.strip_prefix(key) {
        Some(rest) => Ok(rest.trim()),
        None => Err(ShardcastError(format!(
            "expected '{}' line, got '{}'",
            key, line
        ))),
    }
}

/// Little-endian cursor over a byte slice.
struct Cursor<'b> {
    bytes: &'b [u8],
    offset: usize,
}

impl<'b> Cursor<'b> {
    fn new(bytes: &'b [u8]) -> Self {
        Cursor { bytes, offset: 0 }
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, ShardcastError> {
        if self.offset + len > self.bytes.len() {
            return Err(ShardcastError::msg("truncated view bytes"));
        }
        let out = self.bytes[self.offset..self.offset + len].to_vec();
        self.offset += len;
        Ok(out)
    }

    fn read_i32(&mut self) -> Result<i32, ShardcastError> {
        let bytes = self.read_bytes(4)?;
        Ok(i32::from_le_bytes(bytes.try_into().unwrap()))
    }
}

/// Writes a view to disk as a whole-file rewrite of the binary layout.
pub fn persist_view(
    view: &View,
    path: impl AsRef<Path>,
) -> Result<(), ShardcastError> {
    std::fs::write(path, view.encode())?;
    Ok(())
}

/// Reads a view back from its binary file.
pub fn load_view(path: impl AsRef<Path>) -> Result<View, ShardcastError> {
    View::decode(&std::fs::read(path)?)
}

#[cfg(test)]
mod view_tests {
    use super::*;

    fn sample_view() -> View {
        View {
            vid: 3,
            members: vec![0, 2, 5],
            member_ips: vec![
                "127.0.0.1:12345:12346:12348".into(),
                "127.0.0.1:22345:22346:22348".into(),
                "127.0.0.1:32345:32346:32348".into(),
            ],
            failed: vec![false, true, false],
            num_failed: 1,
            joined: vec![5],
            departed: vec![1],
            my_rank: 2,
        }
    }

    #[test]
    fn binary_roundtrip() {
        let view = sample_view();
        assert_eq!(View::decode(&view.encode()).unwrap(), view);
    }

    #[test]
    fn text_roundtrip() {
        let view = sample_view();
        assert_eq!(View::parse_text(&view.to_text()).unwrap(), view);
    }

    #[test]
    fn file_roundtrip() -> Result<(), ShardcastError> {
        let view = sample_view();
        let path = "/tmp/test-shardcast-view-0.state";
        persist_view(&view, path)?;
        assert_eq!(load_view(path)?, view);
        // whole-file rewrite with a smaller view leaves no tail behind
        let smaller =
            View::new(4, vec![7], vec!["10.0.0.1:1:2:3".into()], 0);
        persist_view(&smaller, path)?;
        assert_eq!(load_view(path)?, smaller);
        Ok(())
    }

    #[test]
    fn leader_skips_failed_members() {
        let mut view = sample_view();
        assert_eq!(view.leader_rank(), Some(0));
        view.failed[0] = true;
        // rank 1 is already failed, so leadership falls to rank 2
        view.failed[1] = true;
        assert_eq!(view.leader_rank(), Some(2));
        assert!(view.i_am_leader());
    }

    #[test]
    fn contact_parsing() {
        let contact = Contact::parse("10.1.2.3:12345:12346:12348").unwrap();
        assert_eq!(contact.ip, "10.1.2.3");
        assert_eq!(contact.gms_port, 12345);
        assert_eq!(
            contact.gms_addr().unwrap(),
            "10.1.2.3:12345".parse().unwrap()
        );
        assert_eq!(contact.to_string(), "10.1.2.3:12345:12346:12348");
        assert!(Contact::parse("10.1.2.3:12345").is_err());
    }
}
