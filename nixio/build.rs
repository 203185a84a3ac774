fn main() {
  cfg_aliases::cfg_aliases! {
      linux: { any(target_os = "linux", target_os = "android") },
      apple: { target_vendor = "apple" },
      bsd: { any(
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "openbsd",
        target_os = "netbsd"
      ) },
      epoll: { linux },
      kqueue: { any(apple, bsd) },
  }
}
